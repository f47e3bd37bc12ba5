use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use super::Operation;
use super::sequence::{OpSequence, SequencerKind};
use super::template::{BindingFn, Bindings, OpTemplate, TemplateKey, diagnose_bindings};
use crate::cycles::Cycle;
use crate::errors::{BindingError, OpError};
use crate::flow::FlowVariables;

/// Maps cycles to fresh operations. Implementations must be pure in the
/// cycle: the same cycle always yields an equivalent operation.
pub trait OpDispenser: Send + Sync {
    /// Fast path. Binding problems may surface as unexplained errors.
    fn create(&self, cycle: Cycle) -> Result<Operation, OpError>;

    /// Slow path used after a binding failure: validate every field and
    /// either return corrected bindings or a fully explained error. Called
    /// at most once per cycle; the motor keeps the result for later tries.
    fn diagnose(&self, cycle: Cycle) -> Result<Bindings, OpError> {
        Err(OpError::fatal(format!(
            "cycle {cycle}: binding failed and this dispenser has no diagnostic path"
        )))
    }

    /// Builds the operation for `cycle` from bindings `diagnose` returned.
    fn rebind(&self, cycle: Cycle, bindings: &Bindings) -> Result<Operation, OpError> {
        let _ = bindings;
        self.create(cycle)
    }
}

impl<F> OpDispenser for F
where
    F: Fn(Cycle) -> Result<Operation, OpError> + Send + Sync,
{
    fn create(&self, cycle: Cycle) -> Result<Operation, OpError> {
        self(cycle)
    }
}

/// Protocol adapter boundary. Adapters turn templates into prepared handles
/// once, and bind per-cycle values into operations without validation.
pub trait Adapter: Send + Sync + 'static {
    type Prepared: Send + Sync + 'static;

    fn name(&self) -> &str;

    fn prepare(
        &self,
        template: &OpTemplate,
        flow_vars: &FlowVariables,
    ) -> Result<Self::Prepared, OpError>;

    fn bind(
        &self,
        prepared: &Arc<Self::Prepared>,
        template: &OpTemplate,
        cycle: Cycle,
        bindings: Bindings,
    ) -> Result<Operation, OpError>;
}

/// Configuration-keyed cache of prepared handles, shared by all motors.
#[derive(Debug)]
pub struct PreparedCache<V> {
    entries: RwLock<HashMap<TemplateKey, Arc<V>>>,
}

impl<V> Default for PreparedCache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> PreparedCache<V> {
    pub fn get(&self, key: &TemplateKey) -> Option<Arc<V>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Returns the cached value or builds it. Concurrent builders for the
    /// same key may both run; the first insert wins and both get it.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: &TemplateKey,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }
        let built = Arc::new(build()?);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(entries.entry(key.clone()).or_insert(built)))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SequencedTemplate {
    template: OpTemplate,
    key: TemplateKey,
    bindings: BindingFn,
}

/// Dispenser over ratio-weighted templates and an injected adapter.
pub struct TemplateDispenser<A: Adapter> {
    adapter: Arc<A>,
    sequence: OpSequence<SequencedTemplate>,
    cache: PreparedCache<A::Prepared>,
    flow_vars: Arc<FlowVariables>,
}

impl<A: Adapter> TemplateDispenser<A> {
    /// Builds the sequence and prepares every template up front so that
    /// configuration errors surface before any cycle runs.
    pub fn new(
        adapter: A,
        templates: Vec<(OpTemplate, BindingFn)>,
        kind: SequencerKind,
        flow_vars: Arc<FlowVariables>,
    ) -> Result<Self, OpError> {
        let weighted = templates
            .into_iter()
            .map(|(template, bindings)| {
                let ratio = template.ratio;
                let key = template.cache_key();
                (
                    SequencedTemplate {
                        template,
                        key,
                        bindings,
                    },
                    ratio,
                )
            })
            .collect();
        let sequence = OpSequence::build(weighted, kind).map_err(OpError::Configuration)?;

        let dispenser = Self {
            adapter: Arc::new(adapter),
            sequence,
            cache: PreparedCache::default(),
            flow_vars,
        };
        for entry in dispenser.sequence.entries() {
            dispenser.prepared(entry).map_err(|error| match error {
                OpError::Configuration(_) => error,
                other => OpError::configuration(format!(
                    "template `{}` could not be prepared: {other}",
                    entry.template.name
                )),
            })?;
        }
        debug!(
            adapter = dispenser.adapter.name(),
            templates = dispenser.sequence.entries().len(),
            sequence_len = dispenser.sequence.len(),
            "prepared op templates"
        );
        Ok(dispenser)
    }

    fn prepared(&self, entry: &SequencedTemplate) -> Result<Arc<A::Prepared>, OpError> {
        self.cache.get_or_try_insert_with(&entry.key, || {
            self.adapter.prepare(&entry.template, &self.flow_vars)
        })
    }

    pub fn template_for(&self, cycle: Cycle) -> &OpTemplate {
        &self.sequence.select(cycle).template
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn prepared_count(&self) -> usize {
        self.cache.len()
    }
}

impl<A: Adapter> OpDispenser for TemplateDispenser<A> {
    fn create(&self, cycle: Cycle) -> Result<Operation, OpError> {
        let entry = self.sequence.select(cycle);
        let prepared = self.prepared(entry)?;
        let bindings = (entry.bindings)(cycle)?;
        self.adapter.bind(&prepared, &entry.template, cycle, bindings)
    }

    fn diagnose(&self, cycle: Cycle) -> Result<Bindings, OpError> {
        let entry = self.sequence.select(cycle);
        let bindings = (entry.bindings)(cycle)?;
        Ok(diagnose_bindings(&entry.template, &bindings)?)
    }

    /// Validated bindings the adapter still refuses are reported with a
    /// snapshot of what was bound.
    fn rebind(&self, cycle: Cycle, bindings: &Bindings) -> Result<Operation, OpError> {
        let entry = self.sequence.select(cycle);
        let prepared = self.prepared(entry)?;
        self.adapter
            .bind(&prepared, &entry.template, cycle, bindings.clone())
            .map_err(|error| match error {
                OpError::Binding(binding) => OpError::Binding(BindingError::Rejected {
                    template: entry.template.name.clone(),
                    bindings: Value::Object(
                        bindings
                            .iter()
                            .map(|(name, value)| (name.clone(), value.clone()))
                            .collect(),
                    ),
                    message: binding.to_string(),
                }),
                other => other,
            })
    }
}
