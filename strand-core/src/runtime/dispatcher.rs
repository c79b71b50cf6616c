//! Event Dispatcher
//!
//! One dispatch pass is a straight line: lock the handler's node path,
//! execute the handler, recompute affected vars, diff, release. The
//! phases never overlap for one session: the next event (or the next
//! chained pass) starts only after the current pass has queued its delta.
//!
//! # Partial Failure
//!
//! A handler fault does not abort the pass. Whatever the handler mutated
//! before faulting stays mutated, recomputation and diffing still run,
//! and the fault rides along in the outcome. The dispatcher never rolls
//! back; keeping mid-handler mutations consistent is the handler author's
//! contract.

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, warn};

use crate::delta::{BroadcastCache, FieldUpdate};
use crate::error::{EventError, HandlerFault};
use crate::schema::{HandlerDef, NodeId, NodePath, Schema, VarId, VarKind};
use crate::state::{recompute, StateTree};
use crate::value::Value;

/// Phase of the per-event dispatch state machine. Linear; entered fresh
/// for every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    Locked,
    Executing,
    Recomputing,
    Diffing,
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchPhase::Idle => "idle",
            DispatchPhase::Locked => "locked",
            DispatchPhase::Executing => "executing",
            DispatchPhase::Recomputing => "recomputing",
            DispatchPhase::Diffing => "diffing",
        };
        f.write_str(name)
    }
}

/// A handler-enqueued follow-up event. Runs as a fresh pass after the
/// current pass's delta has been queued for delivery.
#[derive(Debug, Clone)]
pub struct ChainedEvent {
    pub node_path: NodePath,
    pub handler: String,
    pub args: Vec<Value>,
}

/// Result of one dispatch (the initial pass; chained passes queue their
/// own deltas independently).
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Sequence number of the queued delta, if the pass produced one.
    pub seq: Option<u64>,
    pub updates: Vec<FieldUpdate>,
    /// Application fault raised by the handler or by recomputation.
    pub fault: Option<HandlerFault>,
}

/// Execution context handed to handlers: field access on the locked
/// tree, validated arguments, and chained-event enqueueing.
pub struct HandlerCtx<'a> {
    schema: &'a Schema,
    tree: &'a mut StateTree,
    node: NodeId,
    args: &'a [Value],
    changed: &'a mut HashSet<VarId>,
    chained: &'a mut Vec<ChainedEvent>,
}

impl<'a> HandlerCtx<'a> {
    /// Positional argument access. Arity was checked before execution, so
    /// an out-of-range index is a handler bug and faults.
    pub fn arg(&self, index: usize) -> Result<&Value, HandlerFault> {
        self.args
            .get(index)
            .ok_or_else(|| HandlerFault::new(format!("argument {index} out of range")))
    }

    /// Read a field on the handler's own node.
    pub fn get(&self, field: &str) -> Result<Value, HandlerFault> {
        let path = self.schema.node(self.node).path.clone();
        self.get_at(&path, field)
    }

    /// Read a field on any node by path.
    pub fn get_at(&self, path: &NodePath, field: &str) -> Result<Value, HandlerFault> {
        let var = self.resolve(path, field)?;
        Ok(self.tree.value(self.schema, var).clone())
    }

    /// Set a plain field on the handler's own node, marking it changed.
    pub fn set(&mut self, field: &str, value: Value) -> Result<(), HandlerFault> {
        let path = self.schema.node(self.node).path.clone();
        self.set_at(&path, field, value)
    }

    /// Set a plain field on any node by path, marking it changed.
    /// Multiple sets within one handler still trigger recomputation only
    /// once, after the handler returns.
    pub fn set_at(&mut self, path: &NodePath, field: &str, value: Value) -> Result<(), HandlerFault> {
        let var = self.resolve(path, field)?;
        let def = self.schema.var(var);
        match def.kind {
            VarKind::Plain => {}
            VarKind::Computed => {
                return Err(HandlerFault::new(format!(
                    "cannot assign computed var `{field}`"
                )))
            }
            VarKind::Constant => {
                return Err(HandlerFault::new(format!(
                    "cannot assign constant `{field}`"
                )))
            }
        }
        if !def.ty.admits(&value) {
            return Err(HandlerFault::new(format!(
                "value {:?} does not satisfy type {:?} of `{field}`",
                value, def.ty
            )));
        }
        self.tree.set_value(self.schema, var, value);
        self.changed.insert(var);
        Ok(())
    }

    /// Enqueue a follow-up event. It runs as its own pass, strictly after
    /// this pass's delta has been queued, so clients observe intermediate
    /// states in production order.
    pub fn enqueue(&mut self, node_path: NodePath, handler: &str, args: Vec<Value>) {
        self.chained.push(ChainedEvent {
            node_path,
            handler: handler.to_string(),
            args,
        });
    }

    fn resolve(&self, path: &NodePath, field: &str) -> Result<VarId, HandlerFault> {
        let node = self
            .schema
            .resolve(path)
            .ok_or_else(|| HandlerFault::new(format!("unknown node path `{path}`")))?;
        self.schema
            .var_id(node, field)
            .ok_or_else(|| HandlerFault::new(format!("unknown field `{field}` on `{path}`")))
    }
}

/// Verify an inbound argument list against a handler's declared signature.
pub(crate) fn check_args(handler: &HandlerDef, args: &[Value]) -> Result<(), EventError> {
    if args.len() != handler.params.len() {
        return Err(EventError::BadArguments {
            handler: handler.name.clone(),
            reason: format!("expected {} arguments, got {}", handler.params.len(), args.len()),
        });
    }
    for (i, (param, arg)) in handler.params.iter().zip(args).enumerate() {
        if !param.admits(arg) {
            return Err(EventError::BadArguments {
                handler: handler.name.clone(),
                reason: format!("argument {i} does not satisfy type {param:?}"),
            });
        }
    }
    Ok(())
}

/// Outcome of one pass before sequencing: the updates to broadcast, the
/// fault (if any), and the chained events to run next.
pub(crate) struct PassResult {
    pub updates: Vec<FieldUpdate>,
    pub fault: Option<HandlerFault>,
    pub chained: Vec<ChainedEvent>,
}

/// Run one pass: execute → recompute → diff. Caller holds the lock path.
pub(crate) fn run_pass(
    schema: &Schema,
    tree: &mut StateTree,
    cache: &mut BroadcastCache,
    node: NodeId,
    handler: &HandlerDef,
    args: &[Value],
) -> PassResult {
    let mut changed: HashSet<VarId> = HashSet::new();
    let mut chained: Vec<ChainedEvent> = Vec::new();

    debug!(phase = %DispatchPhase::Executing, handler = %handler.name, "dispatch pass");
    let mut fault = {
        let mut ctx = HandlerCtx {
            schema,
            tree,
            node,
            args,
            changed: &mut changed,
            chained: &mut chained,
        };
        (handler.func)(&mut ctx).err()
    };

    debug!(phase = %DispatchPhase::Recomputing, touched = changed.len(), "dispatch pass");
    let affected = schema.graph().affected_by(&changed);
    for (var, recompute_fault) in recompute(schema, tree, &affected) {
        warn!(var = %schema.var(var).name, fault = %recompute_fault, "recompute fault");
        fault.get_or_insert(recompute_fault);
    }
    changed.extend(affected);

    debug!(phase = %DispatchPhase::Diffing, "dispatch pass");
    let updates = cache.diff(schema, tree, &changed);

    debug!(phase = %DispatchPhase::Idle, updates = updates.len(), "dispatch pass");
    PassResult {
        updates,
        fault,
        chained,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaBuilder, VarRef};
    use crate::value::TypeTag;

    fn fixture() -> (std::sync::Arc<Schema>, StateTree, BroadcastCache) {
        let mut b = SchemaBuilder::new();
        b.plain(&[], "a", TypeTag::Int, Value::Int(1)).unwrap();
        b.plain(&[], "b", TypeTag::Int, Value::Int(2)).unwrap();
        b.computed(
            &[],
            "sum",
            TypeTag::Int,
            vec![VarRef::root("a"), VarRef::root("b")],
            |scope| {
                let a = scope.get_by_name(&NodePath::root(), "a")?;
                let b = scope.get_by_name(&NodePath::root(), "b")?;
                Ok(Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0)))
            },
        )
        .unwrap();
        b.handler(&[], "set_a", &[TypeTag::Int], |ctx| {
            let v = ctx.arg(0)?.clone();
            ctx.set("a", v)
        })
        .unwrap();
        b.handler(&[], "fail_after_write", &[], |ctx| {
            ctx.set("a", Value::Int(99))?;
            Err(HandlerFault::new("boom"))
        })
        .unwrap();
        let schema = b.build().unwrap();
        let tree = StateTree::new(&schema);
        let cache = BroadcastCache::from_tree(&schema, &tree);
        (schema, tree, cache)
    }

    fn run(
        schema: &Schema,
        tree: &mut StateTree,
        cache: &mut BroadcastCache,
        handler: &str,
        args: &[Value],
    ) -> PassResult {
        let root = schema.root();
        let def = schema.handler(root, handler).unwrap();
        run_pass(schema, tree, cache, root, def, args)
    }

    #[test]
    fn mutation_recomputes_and_diffs_dependents() {
        let (schema, mut tree, mut cache) = fixture();
        let result = run(&schema, &mut tree, &mut cache, "set_a", &[Value::Int(5)]);

        let fields: Vec<&str> = result.updates.iter().map(|u| u.field.as_str()).collect();
        assert_eq!(fields, vec!["a", "sum"]);
        assert!(result.fault.is_none());
    }

    #[test]
    fn idempotent_set_produces_empty_delta() {
        let (schema, mut tree, mut cache) = fixture();
        // `a` is already 1.
        let result = run(&schema, &mut tree, &mut cache, "set_a", &[Value::Int(1)]);
        assert!(result.updates.is_empty());
    }

    #[test]
    fn fault_preserves_prior_mutations() {
        let (schema, mut tree, mut cache) = fixture();
        let result = run(&schema, &mut tree, &mut cache, "fail_after_write", &[]);

        assert_eq!(result.fault, Some(HandlerFault::new("boom")));
        assert!(result.updates.iter().any(|u| u.field == "a"));
        assert!(result.updates.iter().any(|u| u.field == "sum"));
    }

    #[test]
    fn assigning_computed_var_faults() {
        let (schema, mut tree, _cache) = fixture();
        let root = schema.root();
        let mut changed = HashSet::new();
        let mut chained = Vec::new();
        let mut ctx = HandlerCtx {
            schema: &schema,
            tree: &mut tree,
            node: root,
            args: &[],
            changed: &mut changed,
            chained: &mut chained,
        };
        let err = ctx.set("sum", Value::Int(0)).unwrap_err();
        assert!(err.message.contains("computed"));
    }

    #[test]
    fn phase_names_follow_the_state_machine() {
        let cycle = [
            DispatchPhase::Idle,
            DispatchPhase::Locked,
            DispatchPhase::Executing,
            DispatchPhase::Recomputing,
            DispatchPhase::Diffing,
            DispatchPhase::Idle,
        ];
        let names: Vec<String> = cycle.iter().map(|p| p.to_string()).collect();
        assert_eq!(
            names,
            ["idle", "locked", "executing", "recomputing", "diffing", "idle"]
        );
    }

    #[test]
    fn argument_signature_is_enforced() {
        let (schema, _, _) = fixture();
        let def = schema.handler(schema.root(), "set_a").unwrap();

        assert!(check_args(def, &[Value::Int(1)]).is_ok());
        assert!(matches!(
            check_args(def, &[]),
            Err(EventError::BadArguments { .. })
        ));
        assert!(matches!(
            check_args(def, &[Value::from("one")]),
            Err(EventError::BadArguments { .. })
        ));
    }
}
