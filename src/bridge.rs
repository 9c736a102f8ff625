//! Value bridge between host [`Value`]s and engine values
//!
//! Engine-to-host conversion walks arrays and objects recursively, keeping the
//! chain of containers currently being visited so cycles are rejected instead
//! of recursing forever. Script functions are parked in a per-environment
//! reference table and handed to the host as [`FunctionRef`]s. A slot is
//! recycled once every host copy of its reference has been dropped.

use std::mem;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rquickjs::{Array, Ctx, Exception, Object, Type, Value as JsValue};

use crate::error::{Error, ErrorKind};
use crate::engine::{FailureTags, Handles, Thrown};
use crate::value::{FunctionRef, Value};

/// Default limit on array/object nesting
pub(crate) const DEFAULT_MARSHAL_DEPTH: usize = 128;

/// Bookkeeping for the function reference table.
///
/// Host references are dropped on arbitrary threads, outside the engine, so
/// a release only queues the slot. The next [`sweep`](RefSlots::sweep) inside
/// the engine clears it and makes it available again.
#[derive(Debug, Default)]
pub(crate) struct RefSlots {
    state: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    /// Dropped by the host, still holding their function
    released: Vec<u32>,
    /// Cleared and ready for reuse
    free: Vec<u32>,
}

impl RefSlots {
    pub fn release(&self, slot: u32) {
        self.state.lock().released.push(slot);
    }

    /// Clear released slots so their functions can be collected
    pub fn sweep<'js>(&self, refs: &Array<'js>) -> rquickjs::Result<()> {
        // Unlocked while clearing: freeing a host closure can release more refs
        let released = mem::take(&mut self.state.lock().released);
        for slot in released {
            refs.set(slot as usize, JsValue::new_undefined(refs.ctx().clone()))?;
            self.state.lock().free.push(slot);
        }
        Ok(())
    }

    fn allocate(&self, refs: &Array<'_>) -> usize {
        self.state
            .lock()
            .free
            .pop()
            .map_or_else(|| refs.len(), |slot| slot as usize)
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.state.lock().released.len()
    }
}

/// Converts values for one environment inside one engine scope
pub(crate) struct Marshaller<'js> {
    ctx: Ctx<'js>,
    refs: Array<'js>,
    failure_tags: FailureTags<'js>,
    slots: Arc<RefSlots>,
    context: u64,
    max_depth: usize,
    ancestors: Vec<JsValue<'js>>,
}

impl<'js> Marshaller<'js> {
    /// Must be called with the runtime lock held, as every engine scope is
    pub fn new(
        ctx: Ctx<'js>,
        handles: &Handles,
        context: u64,
        max_depth: usize,
    ) -> rquickjs::Result<Self> {
        let (refs, failure_tags) = handles.restore(&ctx)?;
        Ok(Marshaller {
            ctx,
            refs,
            failure_tags,
            slots: Arc::clone(handles.slots()),
            context,
            max_depth,
            ancestors: Vec::new(),
        })
    }

    /// Tags of errors raised for host callback failures
    pub fn failure_tags(&self) -> &FailureTags<'js> {
        &self.failure_tags
    }

    /// Clear table slots whose host references were all dropped
    pub fn sweep(&self) -> rquickjs::Result<()> {
        self.slots.sweep(&self.refs)
    }

    /// Convert an engine value into a host value
    pub fn to_host(&mut self, value: &JsValue<'js>) -> Result<Value, Error> {
        match value.type_of() {
            Type::Undefined | Type::Null | Type::Uninitialized => Ok(Value::Nil),
            Type::Bool => Ok(value.as_bool().map_or(Value::Nil, Value::Bool)),
            Type::Int => Ok(value
                .as_int()
                .map_or(Value::Nil, |i| Value::Integer(i64::from(i)))),
            Type::Float => Ok(value.as_float().map_or(Value::Nil, Value::from_number)),
            Type::BigInt => {
                let big = value
                    .as_big_int()
                    .ok_or_else(|| Error::conversion("expected a BigInt"))?;
                big.clone()
                    .to_i64()
                    .map(Value::Integer)
                    .map_err(|_| Error::conversion("BigInt does not fit in a 64-bit integer"))
            }
            Type::String => value
                .get::<String>()
                .map(Value::String)
                .map_err(|err| self.fail(err)),
            Type::Array => self.nested(value, |this, value| this.array_to_host(value)),
            Type::Function | Type::Constructor => self.function_to_host(value),
            Type::Exception => Ok(self.exception_to_host(value)),
            Type::Object | Type::Promise => {
                self.nested(value, |this, value| this.object_to_host(value))
            }
            _ => Ok(Value::Nil),
        }
    }

    /// Convert a host value into an engine value
    pub fn to_js(&self, value: &Value) -> Result<JsValue<'js>, Error> {
        let ctx = self.ctx.clone();
        let converted = match value {
            Value::Nil => JsValue::new_null(ctx),
            Value::Bool(b) => JsValue::new_bool(ctx, *b),
            Value::Integer(i) => match i32::try_from(*i) {
                Ok(small) => JsValue::new_int(ctx, small),
                Err(_) => JsValue::new_float(ctx, *i as f64),
            },
            Value::Float(f) => JsValue::new_float(ctx, *f),
            Value::String(s) => rquickjs::String::from_str(ctx, s)
                .map_err(|err| self.fail(err))?
                .into_value(),
            Value::Array(items) => {
                let array = Array::new(ctx).map_err(|err| self.fail(err))?;
                for (i, item) in items.iter().enumerate() {
                    array
                        .set(i, self.to_js(item)?)
                        .map_err(|err| self.fail(err))?;
                }
                array.into_value()
            }
            Value::Object(props) => {
                let object = Object::new(ctx).map_err(|err| self.fail(err))?;
                for (key, item) in props {
                    object
                        .set(key.as_str(), self.to_js(item)?)
                        .map_err(|err| self.fail(err))?;
                }
                object.into_value()
            }
            Value::Function(func) => self.function_to_js(func)?,
            Value::Error(err) => Exception::from_message(ctx, err.message())
                .map_err(|err| self.fail(err))?
                .into_object()
                .into_value(),
        };
        Ok(converted)
    }

    /// Run `convert` with `value` pushed on the ancestor chain
    fn nested<F>(&mut self, value: &JsValue<'js>, convert: F) -> Result<Value, Error>
    where
        F: FnOnce(&mut Self, &JsValue<'js>) -> Result<Value, Error>,
    {
        if self.ancestors.iter().any(|ancestor| ancestor == value) {
            return Err(Error::conversion("cannot convert a cyclic structure"));
        }
        if self.ancestors.len() >= self.max_depth {
            return Err(Error::conversion(format!(
                "structure is nested deeper than {} levels",
                self.max_depth
            )));
        }
        self.ancestors.push(value.clone());
        let converted = convert(self, value);
        self.ancestors.pop();
        converted
    }

    fn array_to_host(&mut self, value: &JsValue<'js>) -> Result<Value, Error> {
        let array = value
            .as_array()
            .ok_or_else(|| Error::conversion("expected an array"))?;
        let mut items = Vec::with_capacity(array.len());
        for i in 0..array.len() {
            let item: JsValue<'js> = array.get(i).map_err(|err| self.fail(err))?;
            items.push(self.to_host(&item)?);
        }
        Ok(Value::Array(items))
    }

    fn object_to_host(&mut self, value: &JsValue<'js>) -> Result<Value, Error> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::conversion("expected an object"))?;
        let mut props = IndexMap::new();
        for prop in object.props::<String, JsValue<'js>>() {
            let (key, item) = prop.map_err(|err| self.fail(err))?;
            let item = self.to_host(&item)?;
            props.insert(key, item);
        }
        Ok(Value::Object(props))
    }

    fn function_to_host(&self, value: &JsValue<'js>) -> Result<Value, Error> {
        let slot = self.slots.allocate(&self.refs);
        let index = u32::try_from(slot)
            .map_err(|_| Error::conversion("function reference table is full"))?;
        self.refs
            .set(slot, value.clone())
            .map_err(|err| self.fail(err))?;
        let name = value
            .as_object()
            .and_then(|object| object.get::<_, Option<String>>("name").ok().flatten())
            .unwrap_or_default();
        Ok(Value::Function(FunctionRef::new(
            self.context,
            index,
            name,
            Arc::downgrade(&self.slots),
        )))
    }

    fn function_to_js(&self, func: &FunctionRef) -> Result<JsValue<'js>, Error> {
        if func.context_id() != self.context {
            return Err(Error::conversion(format!(
                "function '{}' belongs to another context",
                func.name()
            )));
        }
        let value: JsValue<'js> = self
            .refs
            .get(func.slot() as usize)
            .map_err(|err| self.fail(err))?;
        if value.is_function() {
            Ok(value)
        } else {
            Err(Error::conversion(format!(
                "function reference {} is not valid in this context",
                func.slot()
            )))
        }
    }

    fn exception_to_host(&self, value: &JsValue<'js>) -> Value {
        let thrown = Thrown::from_value(&self.ctx, value.clone(), &self.failure_tags);
        Value::Error(Box::new(crate::error::from_thrown(&thrown)))
    }

    /// Map an engine error raised during conversion, clearing any pending
    /// exception so the environment stays usable.
    fn fail(&self, err: rquickjs::Error) -> Error {
        if err.is_exception() {
            let thrown = Thrown::from_value(&self.ctx, self.ctx.catch(), &self.failure_tags);
            Error::new(ErrorKind::Conversion, thrown.describe())
        } else {
            Error::conversion(err.to_string())
        }
    }
}
