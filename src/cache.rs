//! On-disk cache of compiled models.
//!
//! One file per artifact, named by the hash of the model source and engine
//! version. Entries are written once, after a successful compile, and are
//! never overwritten: a hash match is treated as identity.

use crate::engine::{EngineError, ModelEngine};
use crate::model::{CompiledModel, DataPayload, Draws, FitOptions, ModelSpec};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::NamedTempFile;
use thiserror::Error;

const ARTIFACT_EXTENSION: &str = "bin";

/// Errors from the model cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Model specification is empty")]
    EmptySpec,

    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Whether a lookup reused an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Artifact was read from disk
    Hit,
    /// Artifact was compiled and stored
    Miss,
}

/// Cached artifact on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Artifact hash
    pub hash: String,
    /// File path
    pub path: PathBuf,
    /// Size in bytes
    pub size_bytes: u64,
}

/// Compiled-model cache in front of a [`ModelEngine`]
pub struct ModelCache<E> {
    engine: E,
    dir: PathBuf,
}

impl<E: ModelEngine> ModelCache<E> {
    /// Create a cache rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(engine: E, dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            dir: dir.into(),
        }
    }

    /// Cache directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Underlying engine
    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Path an artifact with this hash is stored at
    #[must_use]
    pub fn artifact_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.{ARTIFACT_EXTENSION}"))
    }

    /// Whether a compiled artifact for `spec` is already cached
    #[must_use]
    pub fn contains(&self, spec: &ModelSpec) -> bool {
        self.artifact_path(&spec.hash(self.engine.version()))
            .is_file()
    }

    /// Return the cached artifact for `spec`, compiling it on a miss.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::EmptySpec` for blank source, the engine's
    /// compilation error unchanged, or an IO error reading or writing the
    /// cache directory.
    pub fn load_or_compile(
        &self,
        spec: &ModelSpec,
    ) -> Result<(CompiledModel, CacheStatus), CacheError> {
        if spec.is_blank() {
            return Err(CacheError::EmptySpec);
        }

        let hash = spec.hash(self.engine.version());
        let path = self.artifact_path(&hash);

        match fs::read(&path) {
            Ok(bytes) => {
                tracing::info!(hash = %hash, "Reusing compiled model");
                return Ok((CompiledModel { hash, bytes }, CacheStatus::Hit));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(hash = %hash, "Compiling model (not cached)");
        let start = Instant::now();
        let bytes = self.engine.compile(spec).inspect_err(|e| {
            tracing::error!(hash = %hash, error = %e, "Model compilation failed");
        })?;
        tracing::info!(
            hash = %hash,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "Model compiled"
        );

        self.store(&path, &bytes)?;
        Ok((CompiledModel { hash, bytes }, CacheStatus::Miss))
    }

    /// Compile (or reuse) `spec` and sample with `data` and `options`.
    ///
    /// # Errors
    ///
    /// See [`Self::load_or_compile`]; sampling failures from the engine are
    /// returned unchanged.
    pub fn fit(
        &self,
        spec: &ModelSpec,
        data: &DataPayload,
        options: &FitOptions,
    ) -> Result<(CompiledModel, Draws), CacheError> {
        let (model, _) = self.load_or_compile(spec)?;

        let start = Instant::now();
        let draws = self.engine.sample(&model, data, options)?;
        tracing::info!(
            hash = %model.hash,
            draws = draws.n_draws(),
            elapsed_secs = start.elapsed().as_secs_f64(),
            "Fit finished"
        );

        Ok((model, draws))
    }

    /// List cached artifacts, sorted by hash
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be read.
    pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            entries.push(CacheEntry {
                hash: hash.to_string(),
                size_bytes: fs::metadata(&path)?.len(),
                path,
            });
        }
        entries.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(entries)
    }

    /// Remove every cached artifact, returning how many were deleted
    ///
    /// # Errors
    ///
    /// Returns an IO error if a file cannot be removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let entries = self.entries()?;
        for entry in &entries {
            fs::remove_file(&entry.path)?;
        }
        tracing::info!(removed = entries.len(), dir = %self.dir.display(), "Cache cleared");
        Ok(entries.len())
    }

    /// Write through a temp file in the cache dir, then link into place
    /// without replacing an existing entry.
    fn store(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;

        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;

        match file.persist_noclobber(path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "Artifact written concurrently; keeping existing");
                Ok(())
            }
            Err(e) => Err(e.error.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Engine that counts calls and rejects sources containing "syntax error"
    struct CountingEngine {
        compiles: Cell<usize>,
        samples: Cell<usize>,
    }

    impl CountingEngine {
        fn new() -> Self {
            Self {
                compiles: Cell::new(0),
                samples: Cell::new(0),
            }
        }
    }

    impl ModelEngine for CountingEngine {
        fn version(&self) -> &str {
            "test-1"
        }

        fn compile(&self, spec: &ModelSpec) -> Result<Vec<u8>, EngineError> {
            self.compiles.set(self.compiles.get() + 1);
            if spec.source().contains("syntax error") {
                return Err(EngineError::Compilation {
                    stderr: "PARSER EXPECTED: <expression>".to_string(),
                });
            }
            Ok(spec.source().as_bytes().to_vec())
        }

        fn sample(
            &self,
            _model: &CompiledModel,
            data: &DataPayload,
            options: &FitOptions,
        ) -> Result<Draws, EngineError> {
            self.samples.set(self.samples.get() + 1);
            if data.get("N").is_none() {
                return Err(EngineError::Sampling {
                    stderr: "variable does not exist; variable name=N".to_string(),
                });
            }
            let rows = options.iter * options.chains;
            Ok(Draws::new(vec!["mu".to_string()], Array2::zeros((rows, 1))).unwrap())
        }
    }

    #[test]
    fn test_second_lookup_is_a_hit() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(CountingEngine::new(), dir.path());
        let spec = ModelSpec::new("parameters { real mu; }");

        let (first, status) = cache.load_or_compile(&spec).unwrap();
        assert_eq!(status, CacheStatus::Miss);
        let (second, status) = cache.load_or_compile(&spec).unwrap();
        assert_eq!(status, CacheStatus::Hit);

        assert_eq!(first, second);
        assert_eq!(cache.engine().compiles.get(), 1);
        assert!(cache.contains(&spec));
    }

    #[test]
    fn test_hit_survives_new_cache_instance() {
        let dir = TempDir::new().unwrap();
        let spec = ModelSpec::new("model { }");

        ModelCache::new(CountingEngine::new(), dir.path())
            .load_or_compile(&spec)
            .unwrap();

        let cache = ModelCache::new(CountingEngine::new(), dir.path());
        let (_, status) = cache.load_or_compile(&spec).unwrap();
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(cache.engine().compiles.get(), 0);
    }

    #[test]
    fn test_compile_failure_leaves_cache_untouched() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(CountingEngine::new(), dir.path().join("models"));
        let spec = ModelSpec::new("model { syntax error }");

        let err = cache.load_or_compile(&spec).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Engine(EngineError::Compilation { .. })
        ));
        assert!(cache.entries().unwrap().is_empty());
        assert!(!cache.contains(&spec));
    }

    #[test]
    fn test_empty_spec_rejected_before_engine() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(CountingEngine::new(), dir.path());
        let err = cache.load_or_compile(&ModelSpec::new("   ")).unwrap_err();
        assert!(matches!(err, CacheError::EmptySpec));
        assert_eq!(cache.engine().compiles.get(), 0);
    }

    #[test]
    fn test_fit_returns_draws() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(CountingEngine::new(), dir.path());
        let spec = ModelSpec::new("data { int N; } parameters { real mu; }");
        let data = DataPayload::new().with_int("N", 10);
        let options = FitOptions::default().with_iter(50).with_chains(2);

        let (model, draws) = cache.fit(&spec, &data, &options).unwrap();
        assert_eq!(draws.n_draws(), 100);
        assert_eq!(model.hash, spec.hash("test-1"));

        cache.fit(&spec, &data, &options).unwrap();
        assert_eq!(cache.engine().compiles.get(), 1);
        assert_eq!(cache.engine().samples.get(), 2);
    }

    #[test]
    fn test_fit_propagates_sampling_error() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(CountingEngine::new(), dir.path());
        let spec = ModelSpec::new("data { int N; }");

        let err = cache
            .fit(&spec, &DataPayload::new(), &FitOptions::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::Engine(EngineError::Sampling { .. })));
        assert!(err.to_string().contains("variable name=N"));
        // The compile succeeded, so the artifact stays cached
        assert!(cache.contains(&spec));
    }

    #[test]
    fn test_existing_artifact_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(CountingEngine::new(), dir.path());
        let spec = ModelSpec::new("model { }");
        let path = cache.artifact_path(&spec.hash("test-1"));

        std::fs::write(&path, b"prebuilt").unwrap();
        cache.store(&path, b"rebuilt").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"prebuilt");

        let (model, status) = cache.load_or_compile(&spec).unwrap();
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(model.bytes, b"prebuilt");
    }

    #[test]
    fn test_entries_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(CountingEngine::new(), dir.path());
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        cache.load_or_compile(&ModelSpec::new("model { a }")).unwrap();
        cache.load_or_compile(&ModelSpec::new("model { b }")).unwrap();

        let entries = cache.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.windows(2).all(|w| w[0].hash < w[1].hash));
        assert!(entries.iter().all(|e| e.size_bytes > 0));

        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.entries().unwrap().is_empty());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_entries_of_missing_dir() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(CountingEngine::new(), dir.path().join("absent"));
        assert!(cache.entries().unwrap().is_empty());
        assert_eq!(cache.clear().unwrap(), 0);
    }
}
