//! Backbone feature cache for the head-only training stage.

use crate::{
    anchors::Scale, annotation::AnnotationRecord, common::*, producer::SampleProducer,
};

/// Per-scale backbone activations, index-aligned with the samples they were
/// computed from. Each tensor is shaped `[N, C_s, h_s, w_s]`.
#[derive(Debug)]
pub struct BottleneckFeatures {
    pub coarse: Tensor,
    pub medium: Tensor,
    pub fine: Tensor,
}

impl BottleneckFeatures {
    pub fn new(coarse: Tensor, medium: Tensor, fine: Tensor) -> Result<Self> {
        let features = Self {
            coarse,
            medium,
            fine,
        };
        let len = features.coarse.size().first().copied().unwrap_or(0);
        for (scale, tensor) in features.iter() {
            let shape = tensor.size();
            ensure!(
                shape.len() == 4,
                "the {} features must have 4 dimensions, but get {:?}",
                scale.name(),
                shape
            );
            ensure!(
                shape[0] == len,
                "the {} features have {} samples, but expect {}",
                scale.name(),
                shape[0],
                len
            );
        }
        Ok(features)
    }

    pub fn get(&self, scale: Scale) -> &Tensor {
        match scale {
            Scale::Coarse => &self.coarse,
            Scale::Medium => &self.medium,
            Scale::Fine => &self.fine,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Scale, &Tensor)> {
        Scale::ALL.into_iter().map(move |scale| (scale, self.get(scale)))
    }

    /// The number of samples.
    pub fn len(&self) -> usize {
        self.coarse.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits into the first `index` samples and the rest.
    pub fn split_at(&self, index: usize) -> Result<(Self, Self)> {
        let len = self.len();
        ensure!(
            index <= len,
            "split index {} exceeds the number of samples {}",
            index,
            len
        );
        let index = index as i64;
        let rest = len as i64 - index;
        let head = self.map(|tensor| tensor.narrow(0, 0, index));
        let tail = self.map(|tensor| tensor.narrow(0, index, rest));
        Ok((head, tail))
    }

    /// Gathers the samples at `indexes` in the given order.
    pub fn select(&self, indexes: &[usize]) -> Self {
        let indexes: Vec<i64> = indexes.iter().map(|&index| index as i64).collect();
        let indexes = Tensor::of_slice(&indexes).to_device(self.coarse.device());
        self.map(|tensor| tensor.index_select(0, &indexes))
    }

    /// Concatenates chunks along the sample dimension.
    pub fn stack(chunks: &[Self]) -> Result<Self> {
        ensure!(!chunks.is_empty(), "no feature chunks to stack");
        let cat = |scale: Scale| {
            let tensors: Vec<_> = chunks.iter().map(|chunk| chunk.get(scale)).collect();
            Tensor::cat(&tensors, 0)
        };
        Self::new(cat(Scale::Coarse), cat(Scale::Medium), cat(Scale::Fine))
    }

    pub fn equal(&self, other: &Self) -> bool {
        Scale::ALL.iter().all(|&scale| {
            let lhs = self.get(scale);
            let rhs = other.get(scale);
            lhs.size() == rhs.size() && lhs.equal(rhs)
        })
    }

    pub fn shallow_clone(&self) -> Self {
        self.map(Tensor::shallow_clone)
    }

    pub fn to_device(&self, device: Device) -> Self {
        self.map(|tensor| tensor.to_device(device))
    }

    fn map<F>(&self, mut f: F) -> Self
    where
        F: FnMut(&Tensor) -> Tensor,
    {
        Self {
            coarse: f(&self.coarse),
            medium: f(&self.medium),
            fine: f(&self.fine),
        }
    }
}

/// Runs the frozen backbone on a batch of images.
pub trait FeatureExtractor {
    /// Takes `[b, 3, H, W]` images and returns features of `b` samples.
    fn extract(&mut self, images: &Tensor) -> Result<BottleneckFeatures>;
}

/// Identifies the weights file the features were computed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightsStamp {
    pub path: PathBuf,
    pub len: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub modified: u128,
}

impl WeightsStamp {
    pub fn new<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let meta = fs::metadata(path)
            .with_context(|| format!("failed to stat weights file '{}'", path.display()))?;
        let modified = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);

        Ok(Self {
            path: path.to_owned(),
            len: meta.len(),
            modified,
        })
    }
}

/// What a cache file was computed from. A cache is reused only if its stored
/// fingerprint equals the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFingerprint {
    pub input_size: HW<usize>,
    /// Raw annotation lines in cached order.
    pub records: Vec<String>,
    pub weights: Option<WeightsStamp>,
}

impl CacheFingerprint {
    pub fn new<P>(
        input_size: HW<usize>,
        records: &[Arc<AnnotationRecord>],
        weights_file: Option<P>,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let weights = weights_file.map(WeightsStamp::new).transpose()?;
        Ok(Self {
            input_size,
            records: records
                .iter()
                .map(|record| record.line().to_owned())
                .collect(),
            weights,
        })
    }
}

/// Location of a persisted cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    path: PathBuf,
}

impl CacheHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The JSON file storing the fingerprint next to the tensor file.
    pub fn fingerprint_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }
}

/// The on-disk bottleneck cache.
#[derive(Debug, Clone)]
pub struct BottleneckCache {
    handle: CacheHandle,
}

impl BottleneckCache {
    pub fn new<P>(path: P) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            handle: CacheHandle {
                path: path.as_ref().to_owned(),
            },
        }
    }

    pub fn handle(&self) -> &CacheHandle {
        &self.handle
    }

    /// Runs the extractor over every sample once, in sequence order, in chunks
    /// of `batch_size` without augmentation.
    pub fn compute<E>(
        extractor: &mut E,
        sequence: &[Arc<AnnotationRecord>],
        batch_size: usize,
        producer: &dyn SampleProducer,
        input_size: HW<usize>,
    ) -> Result<BottleneckFeatures>
    where
        E: FeatureExtractor + ?Sized,
    {
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(!sequence.is_empty(), "cannot compute features of no samples");

        let num_samples = sequence.len();
        let mut rng = StdRng::seed_from_u64(0);
        let mut done = 0;

        let chunks: Vec<_> = sequence
            .chunks(batch_size)
            .map(|chunk| -> Result<_> {
                let images: Vec<_> = chunk
                    .iter()
                    .map(|record| -> Result<_> {
                        let sample = producer.produce(record, input_size, false, true, &mut rng)?;
                        sample.image.ok_or_else(|| {
                            format_err!("no image produced for '{}'", record.image.display())
                        })
                    })
                    .try_collect()?;
                let images = Tensor::stack(&images, 0);
                let features = extractor.extract(&images)?;
                ensure!(
                    features.len() == chunk.len(),
                    "the extractor returns {} samples for a batch of {}",
                    features.len(),
                    chunk.len()
                );

                done += chunk.len();
                info!("bottleneck progress {}/{}", done, num_samples);
                Ok(features.to_device(Device::Cpu))
            })
            .try_collect()?;

        BottleneckFeatures::stack(&chunks)
    }

    /// Checks whether a cache computed from `fingerprint` is on disk.
    pub fn is_valid(&self, fingerprint: &CacheFingerprint) -> bool {
        let tensor_path = self.handle.path();
        let fingerprint_path = self.handle.fingerprint_path();
        if !tensor_path.is_file() || !fingerprint_path.is_file() {
            return false;
        }

        let stored: Result<CacheFingerprint> = (|| {
            let text = fs::read_to_string(&fingerprint_path)?;
            Ok(serde_json::from_str(&text)?)
        })();

        match stored {
            Ok(stored) => {
                let is_valid = stored == *fingerprint;
                if !is_valid {
                    warn!(
                        "the bottleneck cache '{}' was computed from different inputs",
                        tensor_path.display()
                    );
                }
                is_valid
            }
            Err(err) => {
                warn!(
                    "unable to read cache fingerprint '{}': {:#}",
                    fingerprint_path.display(),
                    err
                );
                false
            }
        }
    }

    /// Writes the three named feature tensors and the fingerprint sidecar.
    pub fn persist(
        &self,
        features: &BottleneckFeatures,
        fingerprint: &CacheFingerprint,
    ) -> Result<CacheHandle> {
        let path = self.handle.path();
        ensure!(
            features.len() == fingerprint.records.len(),
            "{} feature samples do not match {} records",
            features.len(),
            fingerprint.records.len()
        );
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        // a stale sidecar must not validate the new tensor file if writing fails midway
        let fingerprint_path = self.handle.fingerprint_path();
        if fingerprint_path.exists() {
            fs::remove_file(&fingerprint_path)?;
        }

        let named: Vec<_> = features
            .iter()
            .map(|(scale, tensor)| (scale.name(), tensor))
            .collect();
        Tensor::save_multi(&named, path)
            .with_context(|| format!("failed to write bottleneck cache '{}'", path.display()))?;
        fs::write(&fingerprint_path, serde_json::to_string_pretty(fingerprint)?)?;

        Ok(self.handle.clone())
    }

    /// Loads the features of a persisted cache.
    pub fn load(handle: &CacheHandle) -> Result<BottleneckFeatures> {
        let path = handle.path();
        let mut named = Tensor::load_multi(path)
            .with_context(|| format!("failed to read bottleneck cache '{}'", path.display()))?;
        ensure!(
            named.len() == Scale::ALL.len(),
            "expect {} tensors in '{}', but get {}",
            Scale::ALL.len(),
            path.display(),
            named.len()
        );

        let mut take = |scale: Scale| -> Result<Tensor> {
            let index = named
                .iter()
                .position(|(name, _)| name == scale.name())
                .ok_or_else(|| {
                    format_err!(
                        "the '{}' tensor is missing in '{}'",
                        scale.name(),
                        path.display()
                    )
                })?;
            Ok(named.swap_remove(index).1)
        };
        let coarse = take(Scale::Coarse)?;
        let medium = take(Scale::Medium)?;
        let fine = take(Scale::Fine)?;

        BottleneckFeatures::new(coarse, medium, fine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(len: i64) -> BottleneckFeatures {
        let make = |channels: i64, size: i64| {
            Tensor::arange(len * channels * size * size, FLOAT_CPU)
                .view([len, channels, size, size])
        };
        BottleneckFeatures::new(make(4, 1), make(2, 2), make(1, 4)).unwrap()
    }

    #[test]
    fn split_and_select() {
        let features = features(5);
        let (train, val) = features.split_at(3).unwrap();
        assert_eq!(train.len(), 3);
        assert_eq!(val.len(), 2);
        assert!(val.coarse.get(0).equal(&features.coarse.get(3)));

        let selected = features.select(&[4, 0]);
        assert_eq!(selected.len(), 2);
        assert!(selected.fine.get(0).equal(&features.fine.get(4)));
        assert!(selected.fine.get(1).equal(&features.fine.get(0)));

        let restored = BottleneckFeatures::stack(&[train, val]).unwrap();
        assert!(restored.equal(&features));
        assert!(features.split_at(6).is_err());
    }

    #[test]
    fn reject_misaligned_features() {
        let result = BottleneckFeatures::new(
            Tensor::zeros(&[2, 1, 1, 1], FLOAT_CPU),
            Tensor::zeros(&[3, 1, 1, 1], FLOAT_CPU),
            Tensor::zeros(&[2, 1, 1, 1], FLOAT_CPU),
        );
        assert!(result.is_err());
    }

    #[test]
    fn fingerprint_controls_validity() {
        let dir = std::env::temp_dir().join("yolo-data-cache-fingerprint-test");
        let _ = fs::remove_dir_all(&dir);
        let cache = BottleneckCache::new(dir.join("bottlenecks.pt"));

        let records: Vec<_> = ["a.jpg 1,1,5,5,0", "b.jpg", "c.jpg 2,2,8,8,1"]
            .iter()
            .map(|line| Arc::new(AnnotationRecord::parse_line(line).unwrap()))
            .collect();
        let fingerprint =
            CacheFingerprint::new(HW::new(416, 416), &records, None::<&Path>).unwrap();
        assert!(!cache.is_valid(&fingerprint));

        let handle = cache.persist(&features(3), &fingerprint).unwrap();
        assert!(cache.is_valid(&fingerprint));
        assert!(handle.fingerprint_path().is_file());

        let other_size = CacheFingerprint {
            input_size: HW::new(320, 320),
            ..fingerprint.clone()
        };
        assert!(!cache.is_valid(&other_size));

        let reordered = CacheFingerprint::new(
            HW::new(416, 416),
            &[records[1].clone(), records[0].clone(), records[2].clone()],
            None::<&Path>,
        )
        .unwrap();
        assert!(!cache.is_valid(&reordered));

        let loaded = BottleneckCache::load(&handle).unwrap();
        assert!(loaded.equal(&features(3)));
    }
}
