//! Identities of factories and nodes.
//!
//! The engine works on type-erased keys ([`FactoryKey`], [`NodeKey`]) while
//! the API surface is typed: [`TaskFactoryKey<R, I>`] names a factory
//! producing `R` from an argument `I`, and [`TaskNodeKey<R, I>`] names one
//! node of that factory. A typed key always erases to an equal erased key.

use std::any::{Any, TypeId, type_name};
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Values usable as factory arguments or custom discriminators.
pub trait KeyValue: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn KeyValue) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T> KeyValue for T
where
    T: Any + Debug + Eq + Hash + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn KeyValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// A shared, dynamically typed key component.
#[derive(Clone)]
struct DynValue(Arc<dyn KeyValue>);

impl PartialEq for DynValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for DynValue {}

impl Hash for DynValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

impl Debug for DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// Extra discriminator for factories that share result and argument types.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CustomKey(DynValue);

impl CustomKey {
    pub fn new<T: KeyValue>(value: T) -> Self {
        Self(DynValue(Arc::new(value)))
    }

    pub fn get<T: KeyValue>(&self) -> Option<&T> {
        self.0.0.as_any().downcast_ref::<T>()
    }
}

impl Debug for CustomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy)]
struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Type-erased [`TaskFactoryKey`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FactoryKey {
    result_type: TypeTag,
    arg_type: TypeTag,
    custom_key: Option<CustomKey>,
}

impl FactoryKey {
    pub fn result_type_name(&self) -> &'static str {
        self.result_type.name
    }

    pub fn arg_type_name(&self) -> &'static str {
        self.arg_type.name
    }

    pub fn custom_key(&self) -> Option<&CustomKey> {
        self.custom_key.as_ref()
    }
}

impl Display for FactoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.result_type.name, self.arg_type.name)?;
        if let Some(custom) = &self.custom_key {
            write!(f, " [{custom:?}]")?;
        }
        Ok(())
    }
}

impl Debug for FactoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FactoryKey({self})")
    }
}

/// Identifies the factory creating nodes with results of type `R` from
/// factory arguments of type `I`.
pub struct TaskFactoryKey<R, I> {
    custom_key: Option<CustomKey>,
    _phantom: PhantomData<fn() -> (R, I)>,
}

impl<R: 'static, I: 'static> TaskFactoryKey<R, I> {
    pub fn new() -> Self {
        Self {
            custom_key: None,
            _phantom: PhantomData,
        }
    }

    pub fn with_custom_key<T: KeyValue>(custom_key: T) -> Self {
        Self {
            custom_key: Some(CustomKey::new(custom_key)),
            _phantom: PhantomData,
        }
    }

    pub fn custom_key(&self) -> Option<&CustomKey> {
        self.custom_key.as_ref()
    }

    pub fn erase(&self) -> FactoryKey {
        FactoryKey {
            result_type: TypeTag::of::<R>(),
            arg_type: TypeTag::of::<I>(),
            custom_key: self.custom_key.clone(),
        }
    }
}

impl<R: 'static, I: 'static> Default for TaskFactoryKey<R, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, I> Clone for TaskFactoryKey<R, I> {
    fn clone(&self) -> Self {
        Self {
            custom_key: self.custom_key.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<R, I> PartialEq for TaskFactoryKey<R, I> {
    fn eq(&self, other: &Self) -> bool {
        self.custom_key == other.custom_key
    }
}

impl<R, I> Eq for TaskFactoryKey<R, I> {}

impl<R, I> Hash for TaskFactoryKey<R, I> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.custom_key.hash(state);
    }
}

impl<R: 'static, I: 'static> Debug for TaskFactoryKey<R, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskFactoryKey({})", self.erase())
    }
}

/// Identifies one node of the graph: a factory and the argument passed to it.
pub struct TaskNodeKey<R, I> {
    factory_key: TaskFactoryKey<R, I>,
    factory_arg: I,
}

impl<R: 'static, I: KeyValue + Clone> TaskNodeKey<R, I> {
    pub fn new(factory_key: TaskFactoryKey<R, I>, factory_arg: I) -> Self {
        Self {
            factory_key,
            factory_arg,
        }
    }

    pub fn factory_key(&self) -> &TaskFactoryKey<R, I> {
        &self.factory_key
    }

    pub fn factory_arg(&self) -> &I {
        &self.factory_arg
    }

    pub fn erase(&self) -> NodeKey {
        NodeKey {
            factory_key: self.factory_key.erase(),
            factory_arg: DynValue(Arc::new(self.factory_arg.clone())),
        }
    }
}

impl<R, I: Clone> Clone for TaskNodeKey<R, I> {
    fn clone(&self) -> Self {
        Self {
            factory_key: self.factory_key.clone(),
            factory_arg: self.factory_arg.clone(),
        }
    }
}

impl<R, I: PartialEq> PartialEq for TaskNodeKey<R, I> {
    fn eq(&self, other: &Self) -> bool {
        self.factory_key == other.factory_key && self.factory_arg == other.factory_arg
    }
}

impl<R, I: Eq> Eq for TaskNodeKey<R, I> {}

impl<R, I: Hash> Hash for TaskNodeKey<R, I> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.factory_key.hash(state);
        self.factory_arg.hash(state);
    }
}

impl<R: 'static, I: 'static + Debug> Debug for TaskNodeKey<R, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNodeKey")
            .field("factory_key", &self.factory_key)
            .field("factory_arg", &self.factory_arg)
            .finish()
    }
}

/// Type-erased [`TaskNodeKey`]. Cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    factory_key: FactoryKey,
    factory_arg: DynValue,
}

impl NodeKey {
    pub fn factory_key(&self) -> &FactoryKey {
        &self.factory_key
    }

    /// Downcasts the factory argument, `None` if it is not an `I`.
    pub fn factory_arg<I: KeyValue>(&self) -> Option<&I> {
        self.factory_arg.0.as_any().downcast_ref::<I>()
    }
}

impl<R: 'static, I: KeyValue + Clone> From<&TaskNodeKey<R, I>> for NodeKey {
    fn from(key: &TaskNodeKey<R, I>) -> Self {
        key.erase()
    }
}

impl<R: 'static, I: KeyValue + Clone> From<TaskNodeKey<R, I>> for NodeKey {
    fn from(key: TaskNodeKey<R, I>) -> Self {
        key.erase()
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.factory_key, self.factory_arg)
    }
}

impl Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({self})")
    }
}
