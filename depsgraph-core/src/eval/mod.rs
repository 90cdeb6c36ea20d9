//! Evaluation
//!
//! Everything that happens to a built graph: tagging datablocks for update,
//! flushing the tags through relations, visibility propagation,
//! copy-on-write snapshot management and the evaluation driver that runs
//! the tagged operations in dependency order.
//!
//! # Callbacks
//!
//! Operations carry an optional [`EvalCallback`]. Callbacks never capture
//! node handles or snapshot references; they receive an [`EvalContext`] at
//! call time and resolve what they need through it. This keeps them valid
//! across rebuilds, which reallocate every node.
//!
//! The evaluation bodies themselves (transform math, geometry, pose solving)
//! belong to the embedder and are supplied through [`OperationCallbacks`].

pub mod cow;
pub mod evaluate;
pub mod flush;
pub mod tag;
pub mod visibility;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::graph::Depsgraph;
use crate::node::{EvalCallback, NodeHandle, OperationCode};
use crate::scene::{Datablock, Main, SessionUuid};

pub use evaluate::{evaluate, EvaluationReport};
pub use flush::{clear_updates, flush_updates, FlushSummary};
pub use tag::UpdateSource;

/// What an operation callback sees while it runs.
pub struct EvalContext<'a> {
    pub graph: &'a mut Depsgraph,
    pub main: &'a mut Main,
    /// The operation being evaluated.
    pub operation: NodeHandle,
}

impl<'a> EvalContext<'a> {
    /// Context for running `operation`.
    pub fn new(graph: &'a mut Depsgraph, main: &'a mut Main, operation: NodeHandle) -> Self {
        Self {
            graph,
            main,
            operation,
        }
    }

    /// ID node owning the operation.
    pub fn id_node(&self) -> NodeHandle {
        self.graph.operation_id_node(self.operation)
    }

    /// Session identifier of the datablock being evaluated.
    pub fn id_orig(&self) -> SessionUuid {
        self.graph.id_node(self.id_node()).id_orig
    }

    /// Code of the operation being evaluated.
    pub fn opcode(&self) -> OperationCode {
        self.graph.operation(self.operation).opcode
    }

    /// Frame being evaluated.
    pub fn frame(&self) -> f32 {
        self.graph.frame()
    }

    /// The original datablock in the document.
    pub fn original(&self) -> Option<&Datablock> {
        self.main.get(self.id_orig())
    }

    /// Mutable original, for operations that write results back.
    pub fn original_mut(&mut self) -> Option<&mut Datablock> {
        let uuid = self.id_orig();
        self.main.get_mut(uuid)
    }

    /// Expanded snapshot of the datablock being evaluated.
    pub fn evaluated(&self) -> Option<&Datablock> {
        self.graph.evaluated_snapshot(self.id_orig())
    }

    /// Mutable expanded snapshot of the datablock being evaluated.
    pub fn evaluated_mut(&mut self) -> Option<&mut Datablock> {
        let id = self.id_node();
        let node = self.graph.id_node_mut(id);
        if node.is_cow_expanded() {
            node.id_cow.as_mut()
        } else {
            None
        }
    }
}

/// Embedder supplied evaluation bodies, keyed by operation code.
#[derive(Clone, Default)]
pub struct OperationCallbacks {
    callbacks: HashMap<OperationCode, EvalCallback>,
}

impl OperationCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body of every operation with the given code.
    pub fn insert<F>(&mut self, opcode: OperationCode, callback: F)
    where
        F: Fn(&mut EvalContext<'_>) + Send + Sync + 'static,
    {
        self.callbacks.insert(opcode, Arc::new(callback));
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with<F>(mut self, opcode: OperationCode, callback: F) -> Self
    where
        F: Fn(&mut EvalContext<'_>) + Send + Sync + 'static,
    {
        self.insert(opcode, callback);
        self
    }

    /// Callback registered for `opcode`, ignoring built-ins.
    pub fn get(&self, opcode: OperationCode) -> Option<EvalCallback> {
        self.callbacks.get(&opcode).cloned()
    }

    /// Callback an operation with this code is built with.
    ///
    /// Copy-on-write always uses the built-in body. Other built-ins can be
    /// overridden by the embedder.
    pub fn resolve(&self, opcode: OperationCode) -> Option<EvalCallback> {
        if opcode == OperationCode::CopyOnWrite {
            return evaluate::builtin_callback(opcode);
        }
        self.get(opcode)
            .or_else(|| evaluate::builtin_callback(opcode))
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl fmt::Debug for OperationCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self.callbacks.keys().collect();
        codes.sort();
        f.debug_struct("OperationCallbacks")
            .field("codes", &codes)
            .finish()
    }
}
