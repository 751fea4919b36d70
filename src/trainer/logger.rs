use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::{Error, Result};

pub const SCALARS_FILE: &str = "scalars.tsv";

/// One tracked value, `step` is the epoch it belongs to
#[derive(Clone, Debug, PartialEq)]
pub struct Scalar {
    pub tag: String,
    pub value: f64,
    pub step: usize,
}

/// Appends `tag\tvalue\tstep` rows to `scalars.tsv` in the log directory and
/// forwards every scalar to live subscribers, e.g. a plotting thread
pub struct ScalarLogger {
    path: PathBuf,
    writer: BufWriter<File>,
    subscribers: Vec<Sender<Scalar>>,
}

impl ScalarLogger {
    pub fn new<P: AsRef<Path>>(log_path: P) -> Result<Self> {
        fs::create_dir_all(log_path.as_ref())?;
        let path = log_path.as_ref().join(SCALARS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ScalarLogger { path, writer: BufWriter::new(file), subscribers: Vec::new() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subscribe(&mut self) -> Receiver<Scalar> {
        let (send, recv) = unbounded();
        self.subscribers.push(send);
        recv
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        writeln!(self.writer, "{tag}\t{value}\t{step}")?;
        self.writer.flush()?;
        let scalar = Scalar { tag: tag.to_string(), value, step };
        // receivers that hung up are dropped
        self.subscribers.retain(|s| s.send(scalar.clone()).is_ok());
        Ok(())
    }
}

/// Reads back a file written by [`ScalarLogger`]
pub fn read_scalars<P: AsRef<Path>>(path: P) -> Result<Vec<Scalar>> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            let mut it = line.split('\t');
            let (tag, value, step) = match (it.next(), it.next(), it.next()) {
                (Some(t), Some(v), Some(s)) => (t, v, s),
                _ => return Err(Error::dataset(format!("malformed scalar row: {line}"))),
            };
            let value = value.parse().map_err(|_| Error::dataset(format!("bad value in: {line}")))?;
            let step = step.parse().map_err(|_| Error::dataset(format!("bad step in: {line}")))?;
            Ok(Scalar { tag: tag.to_string(), value, step })
        })
        .collect()
}

#[test]
fn scalars_reach_file_and_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let mut logger = ScalarLogger::new(dir.path().join("exp")).unwrap();
    let recv = logger.subscribe();
    let dropped = logger.subscribe();
    drop(dropped);

    logger.add_scalar("train/loss", 0.5, 0).unwrap();
    logger.add_scalar("val/mae", 1.25, 1).unwrap();
    assert_eq!(logger.subscribers.len(), 1);

    let got: Vec<_> = recv.try_iter().collect();
    assert_eq!(got.len(), 2);
    assert_eq!(got[1], Scalar { tag: "val/mae".into(), value: 1.25, step: 1 });
    assert_eq!(read_scalars(logger.path()).unwrap(), got);
}
