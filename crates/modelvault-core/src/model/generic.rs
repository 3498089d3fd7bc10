//! Loading models whose type is only known after reading the file.
//!
//! The container header is read first to learn the declared type; the payload is
//! then decoded by whatever the [`ModelRegistry`] maps that type to.

use super::source::resolve_source;
use super::{accepted_types, describe, LoadOptions, Model, ModelSource, ModelState, Payload};
use crate::codec::{open_container, ContainerSource, TreeNode};
use crate::metadata::ModelMeta;
use crate::{Result, VaultError};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Object safe view of a [`Payload`].
pub trait AnyPayload: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn dump(&self) -> String;
    fn encode(&self) -> Result<TreeNode>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<P> AnyPayload for P
where
    P: Payload + fmt::Debug + Send + Sync + 'static,
{
    fn type_name(&self) -> &'static str {
        P::NAME
    }

    fn dump(&self) -> String {
        Payload::dump(self)
    }

    fn encode(&self) -> Result<TreeNode> {
        Payload::encode(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Decoder of one registered model type.
pub type PayloadDecoder = fn(&TreeNode) -> Result<Box<dyn AnyPayload>>;

fn decode_boxed<P>(tree: &TreeNode) -> Result<Box<dyn AnyPayload>>
where
    P: Payload + fmt::Debug + Send + Sync + 'static,
{
    Ok(Box::new(P::decode(tree)?))
}

/// Type name to decoder mapping, built once and passed to [`GenericModel::load`].
#[derive(Clone, Default)]
pub struct ModelRegistry {
    decoders: BTreeMap<String, PayloadDecoder>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `P` under its name and every compatible name.
    pub fn register<P>(&mut self) -> &mut Self
    where
        P: Payload + fmt::Debug + Send + Sync + 'static,
    {
        for name in accepted_types::<P>() {
            self.decoders.insert(name, decode_boxed::<P>);
        }
        self
    }

    pub fn decoder(&self, name: &str) -> Option<PayloadDecoder> {
        self.decoders.get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.decoders.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names())
            .finish()
    }
}

/// A model of any type.
///
/// The raw payload tree is always kept. `payload` is set when a registered
/// decoder handled the declared type.
pub struct GenericModel {
    meta: ModelMeta,
    payload: Option<Box<dyn AnyPayload>>,
    tree: TreeNode,
    source: String,
    size: u64,
    container: Option<Arc<ContainerSource>>,
}

impl GenericModel {
    /// Load any model.
    ///
    /// With a registry an unregistered type fails with
    /// [`VaultError::UnknownModelType`]. Without one every type loads and only the
    /// tree is available. Remote sources without an explicit cache directory go to
    /// a temporary directory removed before this returns.
    pub fn load(
        source: &ModelSource,
        registry: Option<&ModelRegistry>,
        options: &LoadOptions<'_>,
    ) -> Result<Self> {
        let resolved = resolve_source(source, None, options)?;
        let container = open_container(&resolved.path, options.lazy)?;
        info!(
            "Reading {} ({} {})...",
            resolved.path.display(),
            container.meta.model_type,
            container.meta.id
        );

        let payload = match registry {
            Some(registry) => {
                let decode = registry
                    .decoder(&container.meta.model_type)
                    .ok_or_else(|| VaultError::UnknownModelType(container.meta.model_type.clone()));
                match decode.and_then(|decode| decode(&container.tree)) {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        container.close();
                        return Err(e);
                    }
                }
            }
            None => {
                debug!("Loading {} without a decoder", container.meta.model_type);
                None
            }
        };
        let source_handle = container.source();
        Ok(Self {
            meta: container.meta,
            payload,
            tree: container.tree,
            source: resolved.label,
            size: container.size,
            container: source_handle,
        })
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn model_type(&self) -> &str {
        &self.meta.model_type
    }

    pub fn payload(&self) -> Option<&dyn AnyPayload> {
        self.payload.as_deref()
    }

    /// The decoded payload as `P`, if that is what was decoded.
    pub fn payload_as<P: 'static>(&self) -> Option<&P> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.as_any().downcast_ref::<P>())
    }

    pub fn tree(&self) -> &TreeNode {
        &self.tree
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn close(&mut self) {
        if let Some(container) = self.container.take() {
            container.close();
        }
    }
}

impl fmt::Display for GenericModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dump = self
            .payload
            .as_ref()
            .map(|payload| payload.dump())
            .unwrap_or_default();
        f.write_str(&describe(&self.meta, self.size, &dump))
    }
}

impl fmt::Debug for GenericModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericModel")
            .field("type", &self.meta.model_type)
            .field("id", &self.meta.id)
            .field("payload", &self.payload.as_ref().map(|p| p.type_name()))
            .field("source", &self.source)
            .finish()
    }
}

/// Take over a generically loaded model as a typed one.
impl<P> TryFrom<GenericModel> for Model<P>
where
    P: Payload + 'static,
{
    type Error = VaultError;

    fn try_from(generic: GenericModel) -> Result<Self> {
        let accepted = accepted_types::<P>();
        if !accepted.contains(&generic.meta.model_type) {
            return Err(VaultError::IncompatibleInstance {
                expected: P::NAME.to_string(),
                actual: generic.meta.model_type,
            });
        }
        let payload = match generic.payload.map(|payload| payload.into_any()) {
            Some(any) => match any.downcast::<P>() {
                Ok(payload) => *payload,
                Err(_) => P::decode(&generic.tree)?,
            },
            None => P::decode(&generic.tree)?,
        };
        Ok(Model::from_parts(
            generic.meta,
            Some(payload),
            ModelState::Loaded,
            Some(generic.source),
            generic.size,
            generic.container,
        ))
    }
}
