#![doc = include_str!("../README.md")]
// Declare modules
pub mod accumulator;
pub mod chunk;
pub mod config;
pub mod connector;
pub mod error;
pub mod ingest;
pub mod measure;
pub mod persistence;
pub mod pool;
pub mod query;
pub mod store;
pub mod telemetry;
pub mod transform;
pub mod types;
pub mod writer;

/// Per-window aggregation state and its registry.
pub use crate::accumulator::{AggregateOp, Accumulator, AccumulatorRegistry};
/// Reserved group code of derived measure series.
pub use crate::chunk::MEASURES_GROUP;
/// Configuration options and layered loading.
pub use crate::config::{load_config, CoreConfig};
/// Source of raw channel samples.
pub use crate::connector::Connector;
/// Error type for all core operations.
pub use crate::error::PulseError;
/// Polling-cycle driver feeding the store and the transformer.
pub use crate::ingest::{ChannelSpec, Ingestor};
/// Measure definitions and the last published values.
pub use crate::measure::{LatestValues, Measure, SourceType, TransformType, Upstream};
/// Snapshot manager for the in-memory document store.
pub use crate::persistence::Snapshotter;
/// Read side: range extraction into a group/path/time matrix.
pub use crate::query::ChunkQueryEngine;
/// Persistence contract and its in-memory implementation.
pub use crate::store::{DocumentStore, MemoryDocumentStore};
/// Structured event hook and alarm extension point.
pub use crate::telemetry::{
    db_metrics, AlarmTransition, AlarmTransitionHook, CoreEvent, CoreEventListener,
};
/// Script engine contract.
pub use crate::transform::script::{DependencyMatrix, NoScriptEngine, ScriptEvaluator, ScriptOutcome};
/// Dependency-ordered measure execution.
pub use crate::transform::{RunGuard, Transformer, TransformerRun};
/// Shared data model.
pub use crate::types::{Chunk, ChunkMetadata, DataType, Matrix, Sample, Timestamp, Value};
/// Write side: series registration and bucketed appends.
pub use crate::writer::{ChunkWriter, WriteResult};
