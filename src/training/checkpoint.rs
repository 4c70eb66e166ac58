use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use log::info;
use safetensors::{
    SafeTensors,
    tensor::{Dtype, TensorView},
};

use crate::{
    arch::ParamStore,
    error::{Result, RetrainErr},
};

/// Receives the model's values whenever a new best validation accuracy is reached.
pub trait CheckpointSink {
    /// Persists `store`.
    ///
    /// # Arguments
    /// * `store` - The model's values.
    /// * `epoch` - The zero based epoch that produced them.
    /// * `top1` - Their validation accuracy.
    fn save(&mut self, store: &ParamStore, epoch: usize, top1: f32) -> Result<()>;
}

/// Writes every named parameter and buffer as an F32 tensor of a safetensors file,
/// overwriting it on every save.
#[derive(Debug, Clone)]
pub struct SafetensorsCheckpoint {
    path: PathBuf,
}

impl SafetensorsCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointSink for SafetensorsCheckpoint {
    fn save(&mut self, store: &ParamStore, epoch: usize, top1: f32) -> Result<()> {
        let params = store
            .param_entries()
            .iter()
            .map(|e| (e, store.param(e.slot)));
        let buffers = store
            .buffer_entries()
            .iter()
            .map(|e| (e, store.buffer(e.slot)));

        let views = params
            .chain(buffers)
            .map(|(entry, values)| {
                let bytes: &[u8] = bytemuck::cast_slice(values);
                let view = TensorView::new(Dtype::F32, entry.shape.clone(), bytes)?;
                Ok::<_, RetrainErr>((entry.name.as_str(), view))
            })
            .collect::<Result<Vec<_>>>()?;

        let metadata = HashMap::from([
            ("epoch".to_string(), epoch.to_string()),
            ("top1".to_string(), format!("{top1:.6}")),
        ]);

        let bytes = safetensors::serialize(views, &Some(metadata))?;
        fs::write(&self.path, bytes).map_err(|e| RetrainErr::io(&self.path, e))?;

        info!("saved checkpoint to {}", self.path.display());
        Ok(())
    }
}

/// Reads back every F32 tensor of a safetensors checkpoint.
///
/// # Returns
/// The shape and the values of every tensor, by name.
pub fn read_checkpoint(path: impl AsRef<Path>) -> Result<BTreeMap<String, (Vec<usize>, Vec<f32>)>> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| RetrainErr::io(path, e))?;
    let tensors = SafeTensors::deserialize(&bytes)?;

    let mut out = BTreeMap::new();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(RetrainErr::UnsupportedTensor {
                name,
                dtype: format!("{:?}", view.dtype()),
            });
        }

        let values = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        out.insert(name, (view.shape().to_vec(), values));
    }

    Ok(out)
}

/// Tracks the best validation accuracy seen so far, starting at 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestTracker {
    best: f32,
}

impl BestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new accuracy.
    ///
    /// # Returns
    /// Whether it ties or beats every previous one, that is, whether it should be saved.
    pub fn observe(&mut self, top1: f32) -> bool {
        if top1 >= self.best {
            self.best = top1;
            return true;
        }

        false
    }

    pub fn best(&self) -> f32 {
        self.best
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::arch::{Init, StoreBuilder};

    #[test]
    fn ties_count_as_improvements() {
        let mut best = BestTracker::new();
        assert!(best.observe(0.0));
        assert!(best.observe(0.5));
        assert!(!best.observe(0.4));
        assert!(best.observe(0.5));
        assert_eq!(best.best(), 0.5);
    }

    #[test]
    fn writes_named_params_and_buffers() {
        let mut builder = StoreBuilder::new(StdRng::seed_from_u64(0));
        builder.scope("stem", |b| {
            b.param("weight", &[2, 3], Init::Ones);
            b.buffer("running_var", &[2], 1.0);
        });
        let store = builder.finish();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best.safetensors");
        let mut sink = SafetensorsCheckpoint::new(&path);
        sink.save(&store, 3, 0.25).unwrap();

        let tensors = read_checkpoint(&path).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors["stem.weight"], (vec![2, 3], vec![1.0; 6]));
        assert_eq!(tensors["stem.running_var"].1, vec![1.0; 2]);
    }

    #[test]
    fn diverged_epoch_does_not_replace_the_best() {
        let mut best = BestTracker::new();
        assert!(best.observe(0.6));

        let nan = ndarray::Array2::from_elem((4, 10), f32::NAN);
        assert!(!best.observe(crate::training::accuracy(nan.view(), &[0, 1, 2, 3], 1)));
        assert_eq!(best.best(), 0.6);
    }

    #[test]
    fn non_f32_tensors_are_rejected() {
        let values = [1.0f64, 2.0];
        let view = TensorView::new(Dtype::F64, vec![2], bytemuck::cast_slice(&values)).unwrap();
        let bytes = safetensors::serialize([("stem.weight", view)], &None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f64.safetensors");
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_checkpoint(&path),
            Err(RetrainErr::UnsupportedTensor { name, .. }) if name == "stem.weight"
        ));
    }

    #[test]
    fn unwritable_path_is_an_io_error() {
        let store = ParamStore::default();
        let mut sink = SafetensorsCheckpoint::new("/no/such/dir/best.safetensors");
        assert!(matches!(sink.save(&store, 0, 0.0), Err(RetrainErr::Io { .. })));
    }
}
