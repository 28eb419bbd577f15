/*!
 * Monitoring
 * Tracing subscriber setup and spans for administrative operations
 */

mod tracer;

pub use tracer::{init_tracing, span_operation};
