//! Cache of loaded task adapters.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device};
use thiserror::Error;

use super::loader::{LoraLoadError, LoraLoader};
use super::types::LoraModel;

/// Errors from the LoRA manager.
#[derive(Debug, Error)]
pub enum LoraManagerError {
    #[error("adapter not found: {0}")]
    AdapterNotFound(String),
    #[error("adapter name already in use: {0}")]
    NameConflict(String),
    #[error("max adapters limit reached: {0}")]
    MaxAdaptersReached(usize),
    #[error("load error: {0}")]
    LoadError(#[from] LoraLoadError),
}

/// Configuration for the LoRA manager.
#[derive(Debug, Clone)]
pub struct LoraManagerConfig {
    /// Maximum number of adapters to keep loaded.
    pub max_adapters: usize,
    /// Whether to optimize (pre-merge scale) adapters on load.
    pub optimize_on_load: bool,
}

impl Default for LoraManagerConfig {
    fn default() -> Self {
        Self {
            max_adapters: 16,
            optimize_on_load: true,
        }
    }
}

/// Result of [`LoraManager::load_adapter`].
#[derive(Debug, Clone)]
pub struct LoadedAdapter {
    pub id: u32,
    pub model: Arc<LoraModel>,
    /// Adapter dropped to make room, if the cache was full.
    pub evicted: Option<Arc<LoraModel>>,
}

/// Loaded task adapters by name, evicted least recently used first.
pub struct LoraManager {
    adapters: HashMap<String, Arc<LoraModel>>,
    /// Front is the eviction candidate.
    recency: VecDeque<String>,
    config: LoraManagerConfig,
    loader: LoraLoader,
    next_id: u32,
}

impl LoraManager {
    pub fn new(device: Device, dtype: DType, config: LoraManagerConfig) -> Self {
        Self {
            adapters: HashMap::new(),
            recency: VecDeque::new(),
            config,
            loader: LoraLoader::new(device, dtype),
            next_id: 1,
        }
    }

    pub fn with_defaults(device: Device, dtype: DType) -> Self {
        Self::new(device, dtype, LoraManagerConfig::default())
    }

    /// Load the artifact at `path` under `name` with a fresh id and cache it.
    ///
    /// A name can only be loaded once; unload it first to replace it. When the
    /// cache is full the least recently used adapter is evicted and returned
    /// so the caller can unregister it.
    pub fn load_adapter(
        &mut self,
        name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<LoadedAdapter, LoraManagerError> {
        let model = self.load(name, path)?;
        self.insert(model)
    }

    /// Read the artifact at `path` under `name` without caching it.
    ///
    /// Nothing is evicted, so the caller can validate the adapter before
    /// handing it to [`Self::insert`].
    pub fn load(
        &mut self,
        name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<LoraModel, LoraManagerError> {
        let name = name.into();
        if self.adapters.contains_key(&name) {
            return Err(LoraManagerError::NameConflict(name));
        }

        let id = self.next_id;
        let mut model = self.loader.load(path, &name, id)?;
        if self.config.optimize_on_load {
            model
                .optimize()
                .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?;
        }
        self.next_id += 1;
        Ok(model)
    }

    /// Cache an adapter from [`Self::load`], evicting the least recently used
    /// one when full.
    pub fn insert(&mut self, model: LoraModel) -> Result<LoadedAdapter, LoraManagerError> {
        if self.adapters.contains_key(&model.name) {
            return Err(LoraManagerError::NameConflict(model.name));
        }
        let evicted = if self.adapters.len() >= self.config.max_adapters {
            Some(self.evict_lru()?)
        } else {
            None
        };

        let id = model.id;
        let name = model.name.clone();
        let model = Arc::new(model);
        self.adapters.insert(name.clone(), Arc::clone(&model));
        self.recency.push_back(name);
        Ok(LoadedAdapter { id, model, evicted })
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoraModel>> {
        self.adapters.get(name).cloned()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn unload(&mut self, name: &str) -> Option<Arc<LoraModel>> {
        let model = self.adapters.remove(name)?;
        self.recency.retain(|n| n != name);
        Some(model)
    }

    /// Loaded adapter names, least recently used first.
    pub fn loaded_adapters(&self) -> Vec<&str> {
        self.recency.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn max_adapters(&self) -> usize {
        self.config.max_adapters
    }

    /// Move `name` to the most recently used end.
    pub fn touch(&mut self, name: &str) {
        if let Some(pos) = self.recency.iter().position(|n| n == name) {
            if let Some(name) = self.recency.remove(pos) {
                self.recency.push_back(name);
            }
        }
    }

    fn evict_lru(&mut self) -> Result<Arc<LoraModel>, LoraManagerError> {
        let name = self
            .recency
            .pop_front()
            .ok_or(LoraManagerError::MaxAdaptersReached(self.config.max_adapters))?;
        let model = self
            .adapters
            .remove(&name)
            .ok_or_else(|| LoraManagerError::AdapterNotFound(name.clone()))?;
        tracing::info!(adapter = %name, id = model.id, "evicted least recently used adapter");
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::loader::peft_tensor_name;
    use crate::lora::LoraConfig;
    use candle_core::Tensor;

    fn write_adapter(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        let config = LoraConfig { r: 2, lora_alpha: 4.0, ..Default::default() };
        std::fs::write(
            dir.join("adapter_config.json"),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();

        let device = Device::Cpu;
        let path = "vit.encoder.layer.0.attention.attention.query";
        let mut tensors = HashMap::new();
        tensors.insert(
            peft_tensor_name(&format!("{path}.lora_A.weight")),
            Tensor::ones((2, 8), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            peft_tensor_name(&format!("{path}.lora_B.weight")),
            Tensor::ones((8, 2), DType::F32, &device).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.join("adapter_model.safetensors")).unwrap();
    }

    fn test_manager(max_adapters: usize) -> LoraManager {
        LoraManager::new(
            Device::Cpu,
            DType::F32,
            LoraManagerConfig {
                max_adapters,
                optimize_on_load: true,
            },
        )
    }

    #[test]
    fn test_load_assigns_ids_and_optimizes() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(&dir.path().join("a"));
        write_adapter(&dir.path().join("b"));

        let mut manager = test_manager(4);
        let a = manager.load_adapter("model1", dir.path().join("a")).unwrap();
        let b = manager.load_adapter("model2", dir.path().join("b")).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert!(a.evicted.is_none());

        let adapter = a
            .model
            .get_adapter("vit.encoder.layer.0.attention.attention.query")
            .unwrap();
        assert!((adapter.scale - 1.0).abs() < f32::EPSILON);

        assert_eq!(manager.get("model2").unwrap().id, 2);
        assert!(matches!(
            manager.load_adapter("model1", dir.path().join("a")),
            Err(LoraManagerError::NameConflict(_))
        ));
    }

    #[test]
    fn test_lru_eviction_returns_evicted() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(dir.path());

        let mut manager = test_manager(2);
        manager.load_adapter("a", dir.path()).unwrap();
        manager.load_adapter("b", dir.path()).unwrap();
        manager.touch("a");

        let c = manager.load_adapter("c", dir.path()).unwrap();
        assert_eq!(c.evicted.unwrap().name, "b");
        assert_eq!(manager.loaded_adapters(), vec!["a", "c"]);
        assert!(!manager.is_loaded("b"));
    }

    #[test]
    fn test_load_leaves_cache_untouched_until_insert() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(dir.path());

        let mut manager = test_manager(1);
        manager.load_adapter("a", dir.path()).unwrap();
        let b = manager.load("b", dir.path()).unwrap();
        assert_eq!(b.id, 2);
        assert_eq!(manager.loaded_adapters(), vec!["a"]);
        assert!(!manager.is_loaded("b"));

        let inserted = manager.insert(b).unwrap();
        assert_eq!(inserted.evicted.unwrap().name, "a");
        assert_eq!(manager.loaded_adapters(), vec!["b"]);

        let mut clash = manager.load("c", dir.path()).unwrap();
        clash.name = "b".to_string();
        assert!(matches!(manager.insert(clash), Err(LoraManagerError::NameConflict(_))));
        assert_eq!(manager.loaded_adapters(), vec!["b"]);
    }

    #[test]
    fn test_unload() {
        let dir = tempfile::tempdir().unwrap();
        write_adapter(dir.path());

        let mut manager = test_manager(4);
        manager.load_adapter("model1", dir.path()).unwrap();
        assert!(manager.unload("model1").is_some());
        assert!(manager.unload("model1").is_none());
        assert!(manager.is_empty());
        assert!(manager.get("model1").is_none());
    }

    #[test]
    fn test_touch_reorders_recency() {
        let mut manager = test_manager(16);
        manager.recency = ["a", "b", "c"].into_iter().map(String::from).collect();

        manager.touch("a");
        assert_eq!(manager.loaded_adapters(), vec!["b", "c", "a"]);
        manager.touch("b");
        assert_eq!(manager.loaded_adapters(), vec!["c", "a", "b"]);
        manager.touch("missing");
        assert_eq!(manager.loaded_adapters(), vec!["c", "a", "b"]);
    }
}
