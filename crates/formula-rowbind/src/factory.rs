//! Building record instances for types the mapper only knows through metadata.
//!
//! Both strategies validate the class up front and fail the same way at `create`. The
//! precompiled strategy clones the constructor handle once; the generic one looks it up in
//! the class on every call. Each call is one indirect call plus a boxed allocation either
//! way.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::compile::lock;
use crate::error::ConstructError;
use crate::meta::{Constructor, Record, RecordClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strategy {
    #[default]
    Precompiled,
    Generic,
}

enum Inner {
    Precompiled(Constructor),
    Generic(Arc<RecordClass>),
}

/// Creates fresh instances of one record type.
pub struct ObjectFactory {
    type_id: TypeId,
    type_name: &'static str,
    strategy: Strategy,
    inner: Inner,
}

impl std::fmt::Debug for ObjectFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectFactory")
            .field("type_name", &self.type_name)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

fn resolve(class: &RecordClass) -> Result<&Constructor, ConstructError> {
    if class.is_abstract {
        return Err(ConstructError::Abstract {
            type_name: class.type_name,
        });
    }
    class.constructor.as_ref().ok_or(ConstructError::NoConstructor {
        type_name: class.type_name,
    })
}

impl ObjectFactory {
    pub fn new(class: &RecordClass, strategy: Strategy) -> Result<Self, ConstructError> {
        let constructor = resolve(class)?;
        let inner = match strategy {
            Strategy::Precompiled => Inner::Precompiled(Arc::clone(constructor)),
            Strategy::Generic => Inner::Generic(Arc::new(class.clone())),
        };
        Ok(Self {
            type_id: class.type_id,
            type_name: class.type_name,
            strategy,
            inner,
        })
    }

    pub(crate) fn from_shared(
        class: &Arc<RecordClass>,
        strategy: Strategy,
    ) -> Result<Self, ConstructError> {
        let constructor = resolve(class)?;
        let inner = match strategy {
            Strategy::Precompiled => Inner::Precompiled(Arc::clone(constructor)),
            Strategy::Generic => Inner::Generic(Arc::clone(class)),
        };
        Ok(Self {
            type_id: class.type_id,
            type_name: class.type_name,
            strategy,
            inner,
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// A new type-erased instance.
    pub fn create(&self) -> Result<Box<dyn Any>, ConstructError> {
        let result = match &self.inner {
            Inner::Precompiled(constructor) => constructor(),
            Inner::Generic(class) => (resolve(class)?)(),
        };
        result.map_err(|source| ConstructError::ConstructorFailed {
            type_name: self.type_name,
            source,
        })
    }

    /// A new instance of `T`; fails with `WrongType` if the class builds something else.
    pub fn create_as<T: Any>(&self) -> Result<T, ConstructError> {
        self.create()?
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| ConstructError::WrongType {
                type_name: self.type_name,
                expected: type_name::<T>(),
            })
    }
}

fn factory_cache() -> &'static Mutex<HashMap<(TypeId, Strategy), Arc<ObjectFactory>>> {
    static CACHE: OnceLock<Mutex<HashMap<(TypeId, Strategy), Arc<ObjectFactory>>>> =
        OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The process-wide factory for `T` under `strategy`.
pub fn factory_for<T: Record>(strategy: Strategy) -> Result<Arc<ObjectFactory>, ConstructError> {
    let key = (TypeId::of::<T>(), strategy);
    if let Some(hit) = lock(factory_cache()).get(&key) {
        return Ok(Arc::clone(hit));
    }

    let factory = Arc::new(ObjectFactory::new(&T::record_class(), strategy)?);
    let mut cache = lock(factory_cache());
    Ok(Arc::clone(cache.entry(key).or_insert(factory)))
}
