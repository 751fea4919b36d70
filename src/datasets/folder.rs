use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use ndarray::prelude::*;
use tracing::{debug, info};

use super::{Dataset, Sample};
use crate::{Error, Result};

pub const LABELS_FILE: &str = "labels.csv";

/// Images in a directory, with targets listed in `labels.csv` as
/// `relative_path,v1,..,vA`. A non-numeric first row is taken as a header,
/// lines starting with '#' are skipped. Images are decoded on access.
pub struct FolderDataset {
    root: PathBuf,
    entries: Vec<(PathBuf, Array1<f32>)>,
    img_size: [usize; 2],
    channels: usize,
}

impl FolderDataset {
    pub fn new<P: AsRef<Path>>(root: P, img_size: [usize; 2], channels: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if channels != 1 && channels != 3 {
            return Err(Error::config(format!("images must have 1 or 3 channels, got {channels}")));
        }
        let labels = root.join(LABELS_FILE);
        let text = fs::read_to_string(&labels)
            .map_err(|e| Error::dataset(format!("cannot read {}: {e}", labels.display())))?;
        let entries = parse_labels(&text)?;
        info!("{}: {} samples", root.display(), entries.len());
        Ok(FolderDataset { root, entries, img_size, channels })
    }

    pub fn num_targets(&self) -> usize {
        self.entries.first().map_or(0, |(_, t)| t.len())
    }

    fn load_image(&self, path: &Path) -> Result<Array3<f32>> {
        let [h, w] = self.img_size;
        let img = image::open(path)?.resize_exact(w as u32, h as u32, FilterType::Triangle);
        let buf = match self.channels {
            1 => img.into_luma8().into_raw(),
            _ => img.into_rgb8().into_raw(),
        };
        let hwc = Array3::from_shape_vec((h, w, self.channels), buf)?;
        Ok(hwc
            .permuted_axes([2, 0, 1])
            .as_standard_layout()
            .mapv(|x| f32::from(x) / 255.0))
    }
}

fn parse_labels(text: &str) -> Result<Vec<(PathBuf, Array1<f32>)>> {
    let mut entries = Vec::new();
    let mut num_targets = None;
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let path = fields.next().unwrap_or_default();
        let values: std::result::Result<Vec<f32>, _> = fields.map(str::parse::<f32>).collect();
        let values = match values {
            Ok(v) => v,
            Err(_) if entries.is_empty() && num_targets.is_none() => {
                debug!("skipping header row: {line}");
                num_targets = Some(line.split(',').count() - 1);
                continue;
            }
            Err(e) => return Err(Error::dataset(format!("{LABELS_FILE}:{}: {e}", lineno + 1))),
        };
        if values.is_empty() {
            return Err(Error::dataset(format!("{LABELS_FILE}:{}: no target values", lineno + 1)));
        }
        match num_targets {
            Some(n) if n != values.len() => {
                return Err(Error::dataset(format!(
                    "{LABELS_FILE}:{}: expected {n} targets, found {}",
                    lineno + 1,
                    values.len()
                )))
            }
            _ => num_targets = Some(values.len()),
        }
        entries.push((PathBuf::from(path), Array1::from(values)));
    }
    Ok(entries)
}

impl Dataset for FolderDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, idx: usize) -> Result<Sample> {
        let (path, target) = self
            .entries
            .get(idx)
            .ok_or_else(|| {
                let n = self.entries.len();
                Error::dataset(format!("index {idx} out of range for {n} samples"))
            })?;
        let image = self.load_image(&self.root.join(path))?;
        Ok(Sample { image, target: target.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_with_header_and_comments() {
        let text = "path,age,height\n# first batch\na.png, 1.5, 2\n\nsub/b.png,3,4\n";
        let entries = parse_labels(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].0, PathBuf::from("sub/b.png"));
        assert_eq!(entries[0].1, arr1(&[1.5f32, 2.0]));
    }

    #[test]
    fn labels_reject_ragged_rows() {
        assert!(parse_labels("a.png,1,2\nb.png,3\n").is_err());
        assert!(parse_labels("a.png,1\nb.png,x\n").is_err());
        assert!(parse_labels("a.png\n").is_err());
    }

    #[test]
    fn loads_and_resizes_images() {
        let dir = tempfile::tempdir().unwrap();
        let img = image::RgbImage::from_pixel(8, 6, image::Rgb([255, 0, 0]));
        img.save(dir.path().join("red.png")).unwrap();
        fs::write(dir.path().join(LABELS_FILE), "red.png,0.25\n").unwrap();

        let rgb = FolderDataset::new(dir.path(), [4, 2], 3).unwrap();
        let s = rgb.get(0).unwrap();
        assert_eq!(s.image.dim(), (3, 4, 2));
        assert!(s.image[[0, 1, 1]] > 0.99);
        assert!(s.image[[1, 1, 1]] < 0.01);
        assert_eq!(s.target, arr1(&[0.25f32]));

        let gray = FolderDataset::new(dir.path(), [3, 3], 1).unwrap();
        assert_eq!(gray.get(0).unwrap().image.dim(), (1, 3, 3));
        assert!(FolderDataset::new(dir.path(), [3, 3], 2).is_err());
    }
}
