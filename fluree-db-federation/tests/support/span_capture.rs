//! Span capture layer for verifying join instrumentation.
//!
//! Records span creation (name, level, fields, parent) plus the names of the
//! threads that entered each span, so tests can check that worker and
//! dispatcher threads run inside the span of the cursor that spawned them.
//!
//! Uses `tracing::subscriber::set_default()` for test isolation. Spans must be
//! *created* on the test thread; they may be entered from any thread.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone)]
pub struct CapturedSpan {
    pub name: &'static str,
    pub level: tracing::Level,
    pub fields: HashMap<String, String>,
    pub parent_name: Option<String>,
    /// Names of threads that entered the span
    pub entered_by: BTreeSet<String>,
}

struct SpanIndex(usize);

#[derive(Debug, Clone, Default)]
pub struct SpanStore(Arc<Mutex<Vec<CapturedSpan>>>);

impl SpanStore {
    pub fn has_span(&self, name: &str) -> bool {
        self.0.lock().iter().any(|s| s.name == name)
    }

    pub fn find_span(&self, name: &str) -> Option<CapturedSpan> {
        self.0.lock().iter().find(|s| s.name == name).cloned()
    }

    pub fn find_spans(&self, name: &str) -> Vec<CapturedSpan> {
        self.0
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    pub fn span_names(&self) -> Vec<&'static str> {
        self.0.lock().iter().map(|s| s.name).collect()
    }
}

pub struct SpanCaptureLayer {
    store: SpanStore,
}

impl<S> Layer<S> for SpanCaptureLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: Context<'_, S>,
    ) {
        let mut fields = FieldVisitor(HashMap::new());
        attrs.record(&mut fields);

        let parent_name = attrs
            .parent()
            .and_then(|pid| ctx.span(pid))
            .map(|span| span.name().to_string())
            .or_else(|| ctx.lookup_current().map(|span| span.name().to_string()));

        let span_ref = ctx.span(id).expect("span should exist in registry");
        let meta = span_ref.metadata();

        let index = {
            let mut store = self.store.0.lock();
            store.push(CapturedSpan {
                name: meta.name(),
                level: *meta.level(),
                fields: fields.0,
                parent_name,
                entered_by: BTreeSet::new(),
            });
            store.len() - 1
        };
        span_ref.extensions_mut().insert(SpanIndex(index));
    }

    fn on_enter(&self, id: &tracing::span::Id, ctx: Context<'_, S>) {
        let Some(span_ref) = ctx.span(id) else {
            return;
        };
        let Some(index) = span_ref.extensions().get::<SpanIndex>().map(|i| i.0) else {
            return;
        };
        let thread = std::thread::current()
            .name()
            .unwrap_or("<unnamed>")
            .to_string();
        if let Some(captured) = self.store.0.lock().get_mut(index) {
            captured.entered_by.insert(thread);
        }
    }
}

struct FieldVisitor(HashMap<String, String>);

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{:?}", value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
}

/// Install a capturing subscriber for the current thread
///
/// Hold the guard for the duration of the test.
pub fn init_test_tracing() -> (SpanStore, tracing::subscriber::DefaultGuard) {
    let store = SpanStore::default();
    let layer = SpanCaptureLayer {
        store: store.clone(),
    };
    let subscriber = tracing_subscriber::registry().with(layer);
    let guard = tracing::subscriber::set_default(subscriber);
    (store, guard)
}
