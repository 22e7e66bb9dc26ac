use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::benchmark::Benchmark;
use crate::error::StoreError;
use crate::interval::{Interval, IntervalKind};
use crate::load::LoadSample;
use crate::model::Model;
use crate::param::{ParamDef, ParamDefSet, ParamVector};

/// Everything about a model that outlives the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// The parameter definitions the model was built over.
    pub params: Vec<ParamDef>,
    /// Number of benchmarks inserted so far.
    pub completion: u64,
    /// Whether construction has finished.
    pub complete: bool,
    /// Every sample, in order.
    pub benchmarks: Vec<Benchmark>,
    /// Pending construction intervals, top first.
    pub intervals: Vec<Interval>,
}

impl From<&Model> for ModelRecord {
    fn from(m: &Model) -> Self {
        ModelRecord {
            params: m.params().defs().to_vec(),
            completion: m.completion(),
            complete: m.is_complete(),
            benchmarks: m.repo().as_slice().to_vec(),
            intervals: m.intervals().into(),
        }
    }
}

impl ModelRecord {
    /// Check that this record, read from `path`, was built over `params`.
    ///
    /// Every stored benchmark and interval must also have one component per parameter.
    pub fn check(&self, path: &Path, params: &ParamDefSet) -> Result<(), StoreError> {
        let mismatch = |reason: String| StoreError::Mismatch {
            path: path.to_path_buf(),
            reason,
        };
        if self.params.as_slice() != params.defs() {
            return Err(mismatch("parameter definitions have changed".to_string()));
        }
        let n_p = params.len();
        let bad_len = |p: &ParamVector| mismatch(format!("{} does not have {} parameters", p, n_p));
        if let Some(b) = self.benchmarks.iter().find(|b| b.params.len() != n_p) {
            return Err(bad_len(&b.params));
        }
        for i in &self.intervals {
            let spans = i.kind.is_segment() || i.kind == IntervalKind::Point;
            for v in [&i.start, &i.end] {
                if (spans || !v.is_empty()) && v.len() != n_p {
                    return Err(bad_len(v));
                }
            }
            if let Some(plane) = i.plane.filter(|&j| j >= n_p) {
                return Err(mismatch(format!("interval on axis {} of {}", plane, n_p)));
            }
        }
        Ok(())
    }
}

/// Where models are kept between runs.
pub trait ModelStore: Send + Sync + fmt::Debug {
    /// Read the model at `path`. A missing file is `Ok(None)`.
    fn load(&self, path: &Path) -> Result<Option<ModelRecord>, StoreError>;

    /// Write `model` to `path`, replacing whatever was there.
    fn save(&self, path: &Path, model: &Model) -> Result<(), StoreError>;
}

/// Models as JSON documents, replaced atomically on every write.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStore;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_err(path: &Path) -> impl FnOnce(serde_json::Error) -> StoreError + '_ {
    move |source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    }
}

impl ModelStore for JsonStore {
    fn load(&self, path: &Path) -> Result<Option<ModelRecord>, StoreError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(path)(e)),
        };
        let record: ModelRecord = serde_json::from_reader(BufReader::new(file)).map_err(json_err(path))?;
        if record.completion != record.benchmarks.len() as u64 {
            return Err(StoreError::Inconsistent {
                path: path.to_path_buf(),
                completion: record.completion,
                found: record.benchmarks.len(),
            });
        }
        Ok(Some(record))
    }

    fn save(&self, path: &Path, model: &Model) -> Result<(), StoreError> {
        let dir = match path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut w, &ModelRecord::from(model)).map_err(json_err(path))?;
            w.flush().map_err(io_err(path))?;
        }
        tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
        Ok(())
    }
}

/// Load samples as a JSON-lines file.
#[derive(Debug, Clone)]
pub struct LoadStore {
    path: PathBuf,
}

impl LoadStore {
    /// Keep samples in the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LoadStore { path: path.into() }
    }

    /// The file samples are kept in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add `samples` to the end of the file.
    pub fn append(&self, samples: &[LoadSample]) -> Result<(), StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err(&self.path))?;
        let mut w = BufWriter::new(file);
        for s in samples {
            serde_json::to_writer(&mut w, s).map_err(json_err(&self.path))?;
            w.write_all(b"\n").map_err(io_err(&self.path))?;
        }
        w.flush().map_err(io_err(&self.path))
    }

    /// Every sample in the file, oldest first. A missing file holds no samples.
    pub fn read_all(&self) -> Result<Vec<LoadSample>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.path)(e)),
        };
        let mut samples = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_err(&self.path))?;
            if line.trim().is_empty() {
                continue;
            }
            samples.push(serde_json::from_str(&line).map_err(json_err(&self.path))?);
        }
        Ok(samples)
    }
}

#[cfg(test)]
fn one_param() -> crate::param::ParamDefSet {
    crate::param::ParamDefSet::new(vec![crate::param::ParamDef::new("n", 0, 100)]).unwrap()
}

#[test]
fn missing_model_is_fresh() {
    let dir = tempfile::tempdir().unwrap();
    assert!(JsonStore.load(&dir.path().join("nope.json")).unwrap().is_none());
}

#[test]
fn model_survives_a_restart() {
    use crate::param::ParamVector;
    use std::time::Duration;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models").join("dgemm.json");
    let mut model = Model::new(one_param());
    model.insert(Benchmark::new(
        ParamVector::new(vec![10]),
        1000,
        Duration::from_millis(10),
        Duration::from_millis(9),
    ));
    model.intervals_mut().push_top(Interval::bisect(
        ParamVector::new(vec![10]),
        ParamVector::new(vec![100]),
    ));
    JsonStore.save(&path, &model).unwrap();

    let record = JsonStore.load(&path).unwrap().unwrap();
    assert_eq!(record, ModelRecord::from(&model));
    let back = Model::restore(one_param(), record);
    assert_eq!(back.completion(), model.completion());
    assert_eq!(back.repo().len(), 2);
    assert_eq!(back.intervals().len(), 1);
}

#[test]
fn changed_params_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.json");
    let two = ParamDefSet::new(vec![ParamDef::new("m", 0, 8), ParamDef::new("n", 0, 8)]).unwrap();
    let mut model = Model::new(two.clone());
    model.insert(Benchmark::estimate(ParamVector::new(vec![4, 4]), 10.0));
    model.intervals_mut().push_top(Interval::boundary_complete());
    JsonStore.save(&path, &model).unwrap();

    let record = JsonStore.load(&path).unwrap().unwrap();
    record.check(&path, &two).unwrap();

    let three = ParamDefSet::new(vec![
        ParamDef::new("m", 0, 8),
        ParamDef::new("n", 0, 8),
        ParamDef::new("k", 0, 8),
    ])
    .unwrap();
    assert!(matches!(record.check(&path, &three), Err(StoreError::Mismatch { .. })));

    let wider = ParamDefSet::new(vec![ParamDef::new("m", 0, 8), ParamDef::new("n", 0, 16)]).unwrap();
    assert!(matches!(record.check(&path, &wider), Err(StoreError::Mismatch { .. })));
}

#[test]
fn short_vectors_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.json");
    let params = one_param();
    let mut record = ModelRecord::from(&Model::new(params.clone()));
    record.check(&path, &params).unwrap();

    let mut bad = record.clone();
    bad.benchmarks.push(Benchmark::estimate(ParamVector::new(vec![3, 3]), 1.0));
    assert!(matches!(bad.check(&path, &params), Err(StoreError::Mismatch { .. })));

    let mut bad = record.clone();
    bad.intervals.push(Interval::bisect(ParamVector::default(), ParamVector::new(vec![100])));
    assert!(matches!(bad.check(&path, &params), Err(StoreError::Mismatch { .. })));

    record.intervals.push(Interval::climb(ParamVector::new(vec![0]), ParamVector::new(vec![100])).on_plane(1));
    assert!(matches!(record.check(&path, &params), Err(StoreError::Mismatch { .. })));
}

#[test]
fn inconsistent_model_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.json");
    let model = Model::new(one_param());
    let mut record = ModelRecord::from(&model);
    record.completion += 3;
    fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();
    match JsonStore.load(&path) {
        Err(StoreError::Inconsistent { completion, found, .. }) => {
            assert_eq!(completion, 4);
            assert_eq!(found, 1);
        }
        r => panic!("unexpected {:?}", r),
    }
}

#[test]
fn load_samples_append() {
    let dir = tempfile::tempdir().unwrap();
    let store = LoadStore::new(dir.path().join("load.jsonl"));
    assert!(store.read_all().unwrap().is_empty());
    let a = LoadSample {
        time: 1,
        load: [1.0, 2.0, 3.0],
    };
    let b = LoadSample {
        time: 2,
        load: [0.5, 0.5, 0.5],
    };
    store.append(&[a]).unwrap();
    store.append(&[b]).unwrap();
    assert_eq!(store.read_all().unwrap(), vec![a, b]);
}
