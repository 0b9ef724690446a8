// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A name-keyed registry multiplexing [`slab_cache::Cache`]s.
//!
//! Components that cannot share a handle directly (plugins, subsystems
//! wired together at runtime) agree on a string key instead. The registry
//! maps each key to one cache; `lookup` hands out fresh handles onto it.
//! Registry mutations are serialized by a mutex, but allocation through the
//! returned handles never touches the registry again, so the map is off
//! every hot path.

#[macro_use]
extern crate lazy_static;

use std::collections::HashMap;
use std::sync::Mutex;

use slab_cache::{Cache, CacheBuilder, ObjectCtor, ObjectDtor};

pub struct Registry {
    caches: Mutex<HashMap<String, Cache>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a hook-less cache under `name` and returns a handle to it.
    ///
    /// Panics if `name` is already registered; two subsystems disagreeing
    /// about who owns a name is a wiring bug worth dying loudly for.
    pub fn create(&self, name: &str, obj_size: usize) -> Cache {
        self.register(name, CacheBuilder::new(obj_size).build())
    }

    /// Creates a cache under `name` with the given object hooks.
    ///
    /// # Safety
    /// The hooks must be sound to call on raw object slots; see
    /// [`CacheBuilder::constructor`] and [`CacheBuilder::destructor`].
    pub unsafe fn create_with_hooks(
        &self,
        name: &str,
        obj_size: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> Cache {
        let mut builder = CacheBuilder::new(obj_size);
        if let Some(ctor) = ctor {
            builder = builder.constructor(ctor);
        }
        if let Some(dtor) = dtor {
            builder = builder.destructor(dtor);
        }
        self.register(name, builder.build())
    }

    fn register(&self, name: &str, cache: Cache) -> Cache {
        let mut caches = self.caches.lock().unwrap();
        assert!(
            !caches.contains_key(name),
            "cache '{}' is already registered",
            name
        );
        let handle = cache.clone();
        caches.insert(name.to_owned(), cache);
        handle
    }

    /// A fresh handle onto the cache registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Cache> {
        self.caches.lock().unwrap().get(name).map(Cache::clone)
    }

    /// Unregisters `name` and releases the cache's backing memory.
    ///
    /// The usual teardown contract applies: no outstanding objects, and any
    /// handles still in circulation become unusable. Panics if `name` was
    /// never registered.
    pub fn destroy(&self, name: &str) {
        let cache = self
            .caches
            .lock()
            .unwrap()
            .remove(name)
            .unwrap_or_else(|| panic!("cache '{}' is not registered", name));
        cache.destroy();
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

lazy_static! {
    static ref GLOBAL: Registry = Registry::new();
}

/// The process-wide registry instance.
pub fn global() -> &'static Registry {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::{self, NonNull};
    use core::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn create_lookup_destroy() {
        let registry = Registry::new();
        let mut created = registry.create("packet", 1500);
        let mut found = registry.lookup("packet").expect("just registered");
        assert_eq!(found.object_size(), created.object_size());

        // both handles draw from the same backing cache
        let a = created.alloc();
        let b = found.alloc();
        assert_ne!(a, b);
        unsafe {
            created.free(a);
            found.free(b);
        }
        drop(created);
        drop(found);
        registry.destroy("packet");
        assert!(registry.lookup("packet").is_none());
    }

    #[test]
    fn names_are_independent() {
        let registry = Registry::new();
        let mut small = registry.create("record.small", 24);
        let mut large = registry.create("record.large", 700);
        assert_eq!(small.object_size(), 32);
        assert_eq!(large.object_size(), 1024);
        let a = small.alloc();
        let b = large.alloc();
        unsafe {
            small.free(a);
            large.free(b);
        }
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_names_panic() {
        let registry = Registry::new();
        let _first = registry.create("dup", 64);
        let _second = registry.create("dup", 64);
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn destroying_unknown_names_panics() {
        let registry = Registry::new();
        registry.destroy("never-created");
    }

    static CTORS: AtomicU64 = AtomicU64::new(0);
    unsafe fn count_ctor(obj: *mut u8) {
        ptr::write(obj as *mut u64, 7);
        CTORS.fetch_add(1, Ordering::Relaxed);
    }
    unsafe fn noop_dtor(_obj: *mut u8) {}

    #[test]
    fn hooks_pass_through() {
        let registry = Registry::new();
        let mut cache = unsafe {
            registry.create_with_hooks("hooked", 64, Some(count_ctor), Some(noop_dtor))
        };
        let before = CTORS.load(Ordering::Relaxed);
        let obj = cache.alloc();
        assert_eq!(CTORS.load(Ordering::Relaxed), before + 1);
        unsafe { cache.free(obj) };
    }

    #[test]
    fn lookups_race_against_each_other() {
        let registry = Registry::new();
        registry.create("shared", 48);
        crossbeam::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    let mut handle = registry.lookup("shared").unwrap();
                    let mut held = Vec::new();
                    for _ in 0..1_000 {
                        held.push(handle.alloc());
                    }
                    unsafe {
                        for obj in held {
                            handle.free(obj);
                        }
                    }
                });
            }
        })
        .unwrap();
    }

    #[test]
    fn global_instance_is_shared() {
        global().create("global.test", 96);
        let mut handle = global().lookup("global.test").unwrap();
        let obj: NonNull<u8> = handle.alloc();
        unsafe { handle.free(obj) };
        drop(handle);
        global().destroy("global.test");
    }
}
