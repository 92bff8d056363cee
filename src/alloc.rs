//! Reference-counted buffer and shader pools.
//!
//! Bindings that reference the same source data share one native object.
//! Buffers are keyed by *reference identity* of their data (the same bytes
//! under a different reference are intentionally a distinct allocation);
//! shaders are keyed by source text. A ref count reaching zero evicts the
//! entry and retires the native handle; retired handles are destroyed by the
//! engine at the next frame boundary.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::traits::{
    BackendResult, BufferHandle, CompilationMessage, ShaderModuleHandle,
};
use crate::backend::types::BufferUsage;
use crate::error::{SceneError, SceneResult};

/// Shared, immutable bytes backing a GPU buffer binding.
///
/// Equality is reference identity: two `BufferData` values compare equal
/// only when they share the same allocation. Clones share it.
#[derive(Debug, Clone)]
pub struct BufferData(Arc<[u8]>);

impl BufferData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }

    /// View a POD slice as buffer bytes.
    pub fn from_pod_slice<T: bytemuck::Pod>(items: &[T]) -> Self {
        Self(Arc::from(bytemuck::cast_slice(items).to_vec()))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable identity key: the address of the shared allocation.
    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl Default for BufferData {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PartialEq for BufferData {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for BufferData {}

#[derive(Debug)]
struct BufferEntry {
    /// Keeps the allocation (and so the identity key) alive.
    _data: BufferData,
    usage: BufferUsage,
    handle: BufferHandle,
    refs: u32,
}

/// Identity-keyed, reference-counted pool of GPU buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    entries: HashMap<usize, BufferEntry>,
    retired: Vec<BufferHandle>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `data`; on a hit, check the recorded usage and bump the ref
    /// count. On a miss, `create` materializes the native buffer from the
    /// bytes.
    pub fn alloc<F>(
        &mut self,
        usage: BufferUsage,
        data: &BufferData,
        create: F,
    ) -> SceneResult<BufferHandle>
    where
        F: FnOnce(&[u8]) -> BackendResult<BufferHandle>,
    {
        use std::collections::hash_map::Entry;
        match self.entries.entry(data.key()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.usage != usage {
                    return Err(SceneError::UsageMismatch);
                }
                entry.refs += 1;
                Ok(entry.handle)
            }
            Entry::Vacant(vacant) => {
                let handle = create(data.bytes())?;
                log::debug!("allocated buffer of {} bytes", data.len());
                vacant.insert(BufferEntry {
                    _data: data.clone(),
                    usage,
                    handle,
                    refs: 1,
                });
                Ok(handle)
            }
        }
    }

    /// Release one reference. At zero the entry is evicted and the native
    /// handle retired for destruction.
    pub fn free(&mut self, data: &BufferData) -> SceneResult<()> {
        let key = data.key();
        let entry = self.entries.get_mut(&key).ok_or(SceneError::DoubleFree)?;
        entry.refs -= 1;
        if entry.refs == 0 {
            let handle = entry.handle;
            self.entries.remove(&key);
            self.retired.push(handle);
        }
        Ok(())
    }

    /// Current reference count for `data` (zero when absent).
    pub fn ref_count(&self, data: &BufferData) -> u32 {
        self.entries.get(&data.key()).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handles whose ref count reached zero since the last drain.
    pub fn take_retired(&mut self) -> Vec<BufferHandle> {
        std::mem::take(&mut self.retired)
    }
}

#[derive(Debug)]
struct ShaderEntry {
    handle: ShaderModuleHandle,
    refs: u32,
    messages: Vec<CompilationMessage>,
    diagnostics_delivered: bool,
}

/// Source-text-keyed, reference-counted pool of compiled shader modules.
#[derive(Debug, Default)]
pub struct ShaderPool {
    entries: HashMap<Arc<str>, ShaderEntry>,
    retired: Vec<ShaderModuleHandle>,
}

impl ShaderPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `source`; compile on a miss. The diagnostics callback is
    /// invoked once per distinct cached module, the first time a caller
    /// requests it.
    pub fn alloc<F>(
        &mut self,
        source: &Arc<str>,
        create: F,
        mut on_diagnostics: Option<&mut dyn FnMut(&[CompilationMessage])>,
    ) -> SceneResult<ShaderModuleHandle>
    where
        F: FnOnce(&str) -> BackendResult<(ShaderModuleHandle, Vec<CompilationMessage>)>,
    {
        if !self.entries.contains_key(source.as_ref()) {
            log::debug!("compiling shader of {} bytes", source.len());
            let (handle, messages) = create(source)?;
            self.entries.insert(
                source.clone(),
                ShaderEntry {
                    handle,
                    refs: 0,
                    messages,
                    diagnostics_delivered: false,
                },
            );
        }
        let entry = self
            .entries
            .get_mut(source.as_ref())
            .unwrap_or_else(|| unreachable!("inserted above"));
        entry.refs += 1;
        if let Some(callback) = on_diagnostics.as_deref_mut() {
            if !entry.diagnostics_delivered {
                entry.diagnostics_delivered = true;
                callback(&entry.messages);
            }
        }
        Ok(entry.handle)
    }

    /// Release one reference. At zero the entry is evicted and the native
    /// handle retired for destruction.
    pub fn free(&mut self, source: &str) -> SceneResult<()> {
        let entry = self.entries.get_mut(source).ok_or(SceneError::DoubleFree)?;
        entry.refs -= 1;
        if entry.refs == 0 {
            log::debug!("destroying shader of {} bytes", source.len());
            let handle = entry.handle;
            self.entries.remove(source);
            self.retired.push(handle);
        }
        Ok(())
    }

    /// Current reference count for `source` (zero when absent).
    pub fn ref_count(&self, source: &str) -> u32 {
        self.entries.get(source).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handles whose ref count reached zero since the last drain.
    pub fn take_retired(&mut self) -> Vec<ShaderModuleHandle> {
        std::mem::take(&mut self.retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_buffer(counter: &mut u64) -> impl FnOnce(&[u8]) -> BackendResult<BufferHandle> + '_ {
        move |_bytes| {
            *counter += 1;
            Ok(BufferHandle(*counter))
        }
    }

    #[test]
    fn test_alloc_shares_by_identity() {
        let mut pool = BufferPool::new();
        let mut created = 0;
        let data = BufferData::new(vec![1, 2, 3, 4]);

        let a = pool
            .alloc(BufferUsage::VERTEX, &data, make_buffer(&mut created))
            .unwrap();
        let b = pool
            .alloc(BufferUsage::VERTEX, &data, make_buffer(&mut created))
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(created, 1);
        assert_eq!(pool.ref_count(&data), 2);
    }

    #[test]
    fn test_same_content_different_reference_is_distinct() {
        let mut pool = BufferPool::new();
        let mut created = 0;
        let a = BufferData::new(vec![1, 2, 3, 4]);
        let b = BufferData::new(vec![1, 2, 3, 4]);
        assert_ne!(a, b);

        let ha = pool
            .alloc(BufferUsage::VERTEX, &a, make_buffer(&mut created))
            .unwrap();
        let hb = pool
            .alloc(BufferUsage::VERTEX, &b, make_buffer(&mut created))
            .unwrap();

        assert_ne!(ha, hb);
        assert_eq!(created, 2);
    }

    #[test]
    fn test_usage_mismatch_rejected() {
        let mut pool = BufferPool::new();
        let mut created = 0;
        let data = BufferData::new(vec![0; 16]);

        pool.alloc(BufferUsage::VERTEX, &data, make_buffer(&mut created))
            .unwrap();
        let err = pool
            .alloc(BufferUsage::UNIFORM, &data, make_buffer(&mut created))
            .unwrap_err();
        assert_eq!(err, SceneError::UsageMismatch);
        assert_eq!(created, 1);
    }

    #[test]
    fn test_free_destroys_exactly_once_then_double_free() {
        let mut pool = BufferPool::new();
        let mut created = 0;
        let data = BufferData::new(vec![9; 8]);

        pool.alloc(BufferUsage::VERTEX, &data, make_buffer(&mut created))
            .unwrap();
        pool.alloc(BufferUsage::VERTEX, &data, make_buffer(&mut created))
            .unwrap();
        assert_eq!(pool.ref_count(&data), 2);

        pool.free(&data).unwrap();
        assert_eq!(pool.ref_count(&data), 1);
        assert!(pool.take_retired().is_empty());

        pool.free(&data).unwrap();
        assert_eq!(pool.ref_count(&data), 0);
        assert_eq!(pool.take_retired().len(), 1);

        assert_eq!(pool.free(&data).unwrap_err(), SceneError::DoubleFree);
    }

    #[test]
    fn test_clone_shares_identity() {
        let mut pool = BufferPool::new();
        let mut created = 0;
        let data = BufferData::new(vec![5; 4]);
        let clone = data.clone();
        assert_eq!(data, clone);

        pool.alloc(BufferUsage::VERTEX, &data, make_buffer(&mut created))
            .unwrap();
        pool.alloc(BufferUsage::VERTEX, &clone, make_buffer(&mut created))
            .unwrap();
        assert_eq!(created, 1);
        assert_eq!(pool.ref_count(&data), 2);
    }

    #[test]
    fn test_from_pod_slice() {
        let data = BufferData::from_pod_slice(&[1.0f32, 2.0, 3.0]);
        assert_eq!(data.len(), 12);
    }

    #[test]
    fn test_shader_pool_keyed_by_source_text() {
        let mut pool = ShaderPool::new();
        let mut created = 0u64;
        let a: Arc<str> = Arc::from("fn main() {}");
        let b: Arc<str> = Arc::from("fn main() {}");

        let mut create = |_: &str| {
            created += 1;
            Ok((ShaderModuleHandle(created), Vec::new()))
        };
        let ha = pool.alloc(&a, &mut create, None).unwrap();
        let hb = pool.alloc(&b, &mut create, None).unwrap();

        // Same text, even under a different Arc, shares one module.
        assert_eq!(ha, hb);
        assert_eq!(created, 1);
        assert_eq!(pool.ref_count(&a), 2);
    }

    #[test]
    fn test_shader_diagnostics_delivered_once() {
        let mut pool = ShaderPool::new();
        let source: Arc<str> = Arc::from("@vertex fn vs() {}");
        let messages = vec![CompilationMessage {
            message: "unused entry point".to_string(),
            line: Some(1),
        }];

        let mut seen = 0;
        let mut on_diag = |msgs: &[CompilationMessage]| {
            seen += 1;
            assert_eq!(msgs.len(), 1);
        };
        pool.alloc(
            &source,
            |_| Ok((ShaderModuleHandle(1), messages.clone())),
            Some(&mut on_diag),
        )
        .unwrap();
        pool.alloc(
            &source,
            |_| unreachable!("cached"),
            Some(&mut on_diag),
        )
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_shader_free_at_zero_retires() {
        let mut pool = ShaderPool::new();
        let source: Arc<str> = Arc::from("fn f() {}");
        pool.alloc(&source, |_| Ok((ShaderModuleHandle(1), Vec::new())), None)
            .unwrap();
        pool.free(&source).unwrap();
        assert_eq!(pool.take_retired(), vec![ShaderModuleHandle(1)]);
        assert_eq!(pool.free(&source).unwrap_err(), SceneError::DoubleFree);
    }
}
