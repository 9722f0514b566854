//! Evaluation contexts.
//!
//! A [`NexusDescriptor`] is the serializable description of a context: the
//! action, the read and write timestamps, the buffer properties, the solution
//! shape and the join defaults. A [`NexusFactory`] is built from a descriptor
//! and hands out one [`EvaluationNexus`] per index manager.

pub mod codec;
mod descriptor;
mod evaluation;
mod factory;
mod fused;

pub use descriptor::{NexusDescriptor, DESCRIPTOR_VERSION};
pub use evaluation::EvaluationNexus;
pub use factory::NexusFactory;
