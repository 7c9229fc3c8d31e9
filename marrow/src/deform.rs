//! Deform operations: host-side per-frame vertex transforms, instantiated
//! from a process-wide factory keyed by operation name.

use std::any::Any;
use std::sync::Arc;

use marrow_types::{semantic_hash, FastHashMap, Format};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::renderer::RendererError;
use crate::scaffold::ModelScaffold;
use crate::vertex_util::{VertexElementRange, VertexElementRangeMut};

/// A pure function from input vertex streams to output vertex streams,
/// scheduled once per frame before draw emission.
pub trait DeformOperation: Send + Sync {
    fn execute(
        &self,
        inputs: &[VertexElementRange<'_>],
        outputs: &mut [VertexElementRangeMut<'_>],
    );

    /// Escape hatch for operations with extra per-frame inputs (the skin
    /// deformer's skeleton feed).
    fn as_any(&self) -> &dyn Any;
}

/// A generated or consumed element, named by semantic.
#[derive(Debug, Clone, PartialEq)]
pub struct NameAndFormat {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub format: Format,
}

impl NameAndFormat {
    pub fn new(semantic_name: &str, semantic_index: u32, format: Format) -> Self {
        Self {
            semantic_name: semantic_name.to_string(),
            semantic_index,
            format,
        }
    }

    pub fn semantic_hash(&self) -> u64 {
        semantic_hash(&self.semantic_name, self.semantic_index)
    }
}

/// One deform operation bound to one geo of a scaffold.
pub struct DeformOperationInstantiation {
    pub operation: Arc<dyn DeformOperation>,
    /// Geo this attaches to. Skinned geos are numbered after static geos.
    pub geo_id: u32,
    /// Elements this operation needs as inputs, either from earlier
    /// operations in the chain or from the scaffold's static data.
    pub upstream_source_elements: Vec<NameAndFormat>,
    /// Elements this operation writes.
    pub generated_elements: Vec<NameAndFormat>,
    /// Semantic hashes whose static-VB bindings must be dropped because
    /// this operation overrides their values.
    pub suppress_elements: Vec<u64>,
}

type InstantiationFn = Box<
    dyn Fn(&str, &Arc<ModelScaffold>) -> Result<Vec<DeformOperationInstantiation>, RendererError>
        + Send
        + Sync,
>;

/// Process-wide registry mapping operation names to instantiation
/// functions.
pub struct DeformOperationFactory {
    registry: RwLock<FastHashMap<String, InstantiationFn>>,
}

static FACTORY: Lazy<DeformOperationFactory> = Lazy::new(|| {
    let factory = DeformOperationFactory {
        registry: RwLock::new(FastHashMap::default()),
    };
    factory.register("skin", |initializer, scaffold| {
        crate::skin_deform::SkinDeformer::instantiate(initializer, scaffold)
    });
    factory
});

impl DeformOperationFactory {
    pub fn global() -> &'static DeformOperationFactory {
        &FACTORY
    }

    pub fn register(
        &self,
        name: &str,
        instantiate: impl Fn(&str, &Arc<ModelScaffold>) -> Result<Vec<DeformOperationInstantiation>, RendererError>
            + Send
            + Sync
            + 'static,
    ) {
        self.registry
            .write()
            .insert(name.to_string(), Box::new(instantiate));
    }

    /// Instantiate a chain from a `;`-separated list of operation names.
    /// Each entry may carry an initializer after a `,`
    /// (`"name,args"`); the full entry is passed through to the operation.
    pub fn create_deform_operations(
        &self,
        operations: &str,
        scaffold: &Arc<ModelScaffold>,
    ) -> Result<Vec<DeformOperationInstantiation>, RendererError> {
        let mut result = Vec::new();
        for entry in operations.split(';').filter(|e| !e.is_empty()) {
            let name = entry.split(',').next().unwrap_or(entry);
            let registry = self.registry.read();
            let instantiate = registry
                .get(name)
                .ok_or_else(|| RendererError::UnknownDeformOperation {
                    name: name.to_string(),
                })?;
            result.extend(instantiate(entry, scaffold)?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDeform;
    impl DeformOperation for NoopDeform {
        fn execute(
            &self,
            _inputs: &[VertexElementRange<'_>],
            _outputs: &mut [VertexElementRangeMut<'_>],
        ) {
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn unknown_operation_names_error() {
        let factory = DeformOperationFactory {
            registry: RwLock::new(FastHashMap::default()),
        };
        factory.register("noop", |_, _| {
            Ok(vec![DeformOperationInstantiation {
                operation: Arc::new(NoopDeform),
                geo_id: 0,
                upstream_source_elements: Vec::new(),
                generated_elements: Vec::new(),
                suppress_elements: Vec::new(),
            }])
        });

        let scaffold = crate::test_util::empty_model_scaffold();
        assert!(factory
            .create_deform_operations("definitely-not-registered", &scaffold)
            .is_err());
        let ops = factory.create_deform_operations("noop", &scaffold).unwrap();
        assert_eq!(ops.len(), 1);
    }
}
