use tracing::Subscriber;
use tracing_subscriber::layer::Layer;

pub mod console;
pub mod file;
pub mod opentelemetry;

pub type BoxLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Stands in for a disabled optional sink.
pub struct NoopLayer;

impl<S> Layer<S> for NoopLayer where S: Subscriber {}

pub fn noop_layer<S>() -> BoxLayer<S>
where
    S: Subscriber + 'static,
{
    Box::new(NoopLayer)
}
