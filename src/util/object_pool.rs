use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Objects that can be reused through an [ObjectPool]
pub trait Poolable: Send + 'static {
    /// called when an object is returned to the pool, bringing it back to its initial state
    fn reset(&mut self);
}

/// A pool of reusable objects of a single type. There is one pool per kind of object (send
///  buffers, receive buffers, inbound events), owned by the component using them.
///
/// Objects are handed out wrapped in a [Pooled] guard which returns them to the pool when it
///  is dropped, so objects find their way back on every path including errors and task
///  cancellation.
pub struct ObjectPool<T: Poolable> {
    objects: Mutex<Vec<T>>,
    max_pool_size: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl <T: Poolable> ObjectPool<T> {
    pub fn new(max_pool_size: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Arc<ObjectPool<T>> {
        Arc::new(ObjectPool {
            objects: Mutex::new(Vec::with_capacity(max_pool_size)),
            max_pool_size,
            factory: Box::new(factory),
        })
    }

    pub fn take(self: &Arc<Self>) -> Pooled<T> {
        Pooled {
            object: Some(self.get_from_pool()),
            pool: self.clone(),
        }
    }

    fn get_from_pool(&self) -> T {
        {
            let mut objects = self.objects.lock().unwrap();
            if let Some(object) = objects.pop() {
                trace!("returning object from pool");
                return object;
            }
        }

        debug!("no object in pool: creating new one");
        (self.factory)()
    }

    fn return_to_pool(&self, mut object: T) {
        object.reset();

        let mut objects = self.objects.lock().unwrap();
        if objects.len() < self.max_pool_size {
            trace!("returning object to pool");
            objects.push(object);
        }
        else {
            debug!("pool is full: discarding returned object");
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

/// Scoped ownership of a pooled object
pub struct Pooled<T: Poolable> {
    object: Option<T>,
    pool: Arc<ObjectPool<T>>,
}

impl <T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref()
            .expect("pooled object is present until drop")
    }
}

impl <T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut()
            .expect("pooled object is present until drop")
    }
}

impl <T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.return_to_pool(object);
        }
    }
}
