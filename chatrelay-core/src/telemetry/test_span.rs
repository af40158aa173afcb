#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Subscriber, span};
use tracing_subscriber::registry;
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

#[derive(Default, Debug)]
pub struct SpanData {
    pub name: String,
    pub fields: Mutex<HashMap<String, String>>, // stringified values via Display/Debug
}

#[derive(Default, Debug)]
pub struct SpanStore {
    pub spans: Mutex<Vec<Arc<SpanData>>>,
    /// Events, named by their target.
    pub events: Mutex<Vec<Arc<SpanData>>>,
    by_id: Mutex<HashMap<span::Id, Arc<SpanData>>>,
}

impl SpanStore {
    /// All spans with `name`, in creation order.
    pub fn named(&self, name: &str) -> Vec<Arc<SpanData>> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// The first event whose message is `message`.
    pub fn event(&self, message: &str) -> Option<Arc<SpanData>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.field("message").as_deref() == Some(message))
            .cloned()
    }
}

impl SpanData {
    pub fn field(&self, key: &str) -> Option<String> {
        self.fields.lock().unwrap().get(key).cloned()
    }
}

struct MapVisitor<'a> {
    map: &'a mut HashMap<String, String>,
}

impl Visit for MapVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        self.map.insert(field.name().to_string(), format!("{value:?}"));
    }
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
    fn record_str(&mut self, field: &Field, value: &str) {
        self.map.insert(field.name().to_string(), value.to_string());
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    pub store: Arc<SpanStore>,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, _ctx: Context<'_, S>) {
        let data = Arc::new(SpanData {
            name: attrs.metadata().name().to_string(),
            ..Default::default()
        });
        attrs.record(&mut MapVisitor {
            map: &mut data.fields.lock().unwrap(),
        });
        self.store.spans.lock().unwrap().push(data.clone());
        self.store.by_id.lock().unwrap().insert(id.clone(), data);
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, _ctx: Context<'_, S>) {
        if let Some(data) = self.store.by_id.lock().unwrap().get(id) {
            values.record(&mut MapVisitor {
                map: &mut data.fields.lock().unwrap(),
            });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let data = Arc::new(SpanData {
            name: event.metadata().target().to_string(),
            ..Default::default()
        });
        event.record(&mut MapVisitor {
            map: &mut data.fields.lock().unwrap(),
        });
        self.store.events.lock().unwrap().push(data);
    }
}

/// Capture spans and events created on this thread until the returned guard is dropped.
pub fn install_capture() -> (Arc<SpanStore>, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::prelude::*;
    let store = Arc::new(SpanStore::default());
    let layer = CaptureLayer {
        store: store.clone(),
    };
    let subscriber = registry::Registry::default().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}
