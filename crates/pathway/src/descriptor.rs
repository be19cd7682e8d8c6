//! Resource descriptors
//!
//! A [ResourceDescriptor] describes one provisionable unit: its kind, its desired configuration and
//! the resources it depends on. Configuration entries are [ConfigValue] trees whose leaves are
//! either literals or [ConfigValue::Pending] placeholders, references to a field another resource
//! only exposes once it is live.
//!
//! Descriptors are validated when built. Every placeholder must point at a declared dependency,
//! so a broken descriptor set is rejected before anything reaches the backend.
use crate::value::{FieldPath, Value};
use indexmap::{IndexMap, IndexSet};

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&$name> for $name {
            fn from(value: &$name) -> Self {
                value.clone()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }
    };
}

string_newtype!(
    /// Logical name of a resource within one run, e.g. `load_balancer`
    ResourceId
);

string_newtype!(
    /// Backend resource type, e.g. `elbv2:listener`
    ResourceKind
);

/// Reference to a field of another resource: `(source, field)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_new::new)]
pub struct FieldRef {
    pub source: ResourceId,
    pub field: FieldPath,
}

impl std::fmt::Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.source, self.field)
    }
}

/// Configuration tree with deferred leaves
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Literal(Value),
    /// Resolved from the cache right before the create call
    Pending(FieldRef),
    List(Vec<ConfigValue>),
    Map(IndexMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn pending(source: impl Into<ResourceId>, field: &str) -> Self {
        ConfigValue::Pending(FieldRef::new(source.into(), FieldPath::parse(field)))
    }

    pub fn list(items: impl IntoIterator<Item = ConfigValue>) -> Self {
        ConfigValue::List(items.into_iter().collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, ConfigValue)>) -> Self {
        ConfigValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// All placeholders in this tree, depth first
    pub fn placeholders(&self) -> Vec<&FieldRef> {
        let mut found = vec![];
        self.collect_placeholders(&mut found);
        found
    }

    fn collect_placeholders<'a>(&'a self, found: &mut Vec<&'a FieldRef>) {
        match self {
            ConfigValue::Literal(_) => {}
            ConfigValue::Pending(field_ref) => found.push(field_ref),
            ConfigValue::List(items) => items.iter().for_each(|i| i.collect_placeholders(found)),
            ConfigValue::Map(entries) => entries
                .values()
                .for_each(|v| v.collect_placeholders(found)),
        }
    }

    /// Replace every placeholder with the value `lookup` returns for it
    ///
    /// Fails with the first reference `lookup` could not answer.
    pub fn inject<F>(&self, lookup: &F) -> Result<Value, FieldRef>
    where
        F: Fn(&FieldRef) -> Option<Value>,
    {
        Ok(match self {
            ConfigValue::Literal(value) => value.clone(),
            ConfigValue::Pending(field_ref) => {
                lookup(field_ref).ok_or_else(|| field_ref.clone())?
            }
            ConfigValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.inject(lookup))
                    .collect::<Result<_, _>>()?,
            ),
            ConfigValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| v.inject(lookup).map(|v| (k.clone(), v)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

macro_rules! literal_from {
    ($($ty:ty),+) => {
        $(
            impl From<$ty> for ConfigValue {
                fn from(value: $ty) -> Self {
                    ConfigValue::Literal(value.into())
                }
            }
        )+
    };
}

literal_from!(Value, &str, String, bool, i64);

/// How a resource comes into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// `create` is issued against the backend
    #[default]
    Create,
    /// The resource already exists. Its handle is the `id` config entry and its fields are
    /// discovered with `describe`.
    Lookup,
}

/// Immutable description of one provisionable unit
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    id: ResourceId,
    kind: ResourceKind,
    mode: Mode,
    config: IndexMap<String, ConfigValue>,
    depends_on: IndexSet<ResourceId>,
    exposes: Vec<FieldPath>,
}

impl ResourceDescriptor {
    pub fn builder(id: impl Into<ResourceId>, kind: impl Into<ResourceKind>) -> DescriptorBuilder {
        DescriptorBuilder {
            id: id.into(),
            kind: kind.into(),
            mode: Mode::Create,
            config: Default::default(),
            depends_on: Default::default(),
            exposes: Default::default(),
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &IndexMap<String, ConfigValue> {
        &self.config
    }

    pub fn depends_on(&self) -> &IndexSet<ResourceId> {
        &self.depends_on
    }

    /// Fields this resource must make available besides its handle
    pub fn exposes(&self) -> &[FieldPath] {
        &self.exposes
    }

    /// All placeholders of all config entries
    pub fn placeholders(&self) -> impl Iterator<Item = &FieldRef> {
        self.config.values().flat_map(ConfigValue::placeholders)
    }

    /// Materialize the config, resolving placeholders through `lookup`
    pub fn inject<F>(&self, lookup: &F) -> Result<Value, FieldRef>
    where
        F: Fn(&FieldRef) -> Option<Value>,
    {
        Ok(Value::Object(
            self.config
                .iter()
                .map(|(k, v)| v.inject(lookup).map(|v| (k.clone(), v)))
                .collect::<Result<_, _>>()?,
        ))
    }
}

pub struct DescriptorBuilder {
    id: ResourceId,
    kind: ResourceKind,
    mode: Mode,
    config: IndexMap<String, ConfigValue>,
    depends_on: IndexSet<ResourceId>,
    exposes: Vec<FieldPath>,
}

impl DescriptorBuilder {
    pub fn lookup(mut self) -> Self {
        self.mode = Mode::Lookup;
        self
    }

    pub fn config(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<ResourceId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn expose(mut self, field: &str) -> Self {
        let field = FieldPath::parse(field);
        if !field.is_id() && !self.exposes.contains(&field) {
            self.exposes.push(field);
        }
        self
    }

    pub fn build(self) -> Result<ResourceDescriptor, DescriptorError> {
        let descriptor = ResourceDescriptor {
            id: self.id,
            kind: self.kind,
            mode: self.mode,
            config: self.config,
            depends_on: self.depends_on,
            exposes: self.exposes,
        };

        for (key, value) in &descriptor.config {
            for reference in value.placeholders() {
                if !descriptor.depends_on.contains(&reference.source) {
                    return Err(DescriptorError::MalformedDependency {
                        resource: descriptor.id.clone(),
                        key: key.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }

        if descriptor.mode == Mode::Lookup && !descriptor.config.contains_key("id") {
            return Err(DescriptorError::LookupWithoutId(descriptor.id));
        }

        tracing::trace!(id = %descriptor.id, kind = %descriptor.kind, "descriptor built");
        Ok(descriptor)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("`{resource}`: config `{key}` references `{reference}`, but `{}` is not a declared dependency", .reference.source)]
    MalformedDependency {
        resource: ResourceId,
        key: String,
        reference: FieldRef,
    },
    #[error("`{0}`: lookup resources need an `id` config entry")]
    LookupWithoutId(ResourceId),
}
