//! Incremental computed-field maintenance.
//!
//! A compute pass runs inside one storage transaction: the
//! [`DependencyCollector`] turns edits into an impact map, the
//! [`ComputeOrchestrator`] locks impacted rows and runs the caller's base
//! update, and the [`ComputedEvaluator`] recomputes what was impacted and
//! queues set-cell ops for the collaboration log.

pub mod batch;
pub mod cardinality;
pub mod collector;
pub mod context;
pub mod evaluator;
pub mod link;
pub mod orchestrator;
pub mod resolver;

pub use batch::BatchService;
pub use cardinality::{handler, link_ids_in, CardinalityHandler, LinkDiff};
pub use collector::{CellChangeSource, ChangeSource, DependencyCollector, FieldChangeSource};
pub use context::ComputeContext;
pub use evaluator::{layer_fields, ComputedEvaluator, DirectCauses, EvaluationReport};
pub use link::{LinkCommitReport, LinkDerivationPlan, LinkService, MirroredCell};
pub use orchestrator::{ComputeOrchestrator, ComputeOutcome, FieldChangePhase};
pub use resolver::{link_edges, LinkCascadeResolver};
