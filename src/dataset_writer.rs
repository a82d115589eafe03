use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::DatasetItem,
    split::{LabelIndex, Split},
    types::DatasetResult,
};

pub const TRAIN: &str = "train";
pub const VALIDATION: &str = "validation";
pub const METADATA_FILE: &str = "metadata.jsonl";

/// Metadata line of one persisted example; `file` is relative to the partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub file: String,
    pub label: usize,
    pub label_name: String,
    pub image_id: u64,
    pub pageid: u64,
    pub title: String,
    pub text: Option<String>,
    pub summary: Option<String>,
}

/// Writes the train and validation partitions under one directory. Staged
/// images are moved, not copied, into their partition.
pub struct DatasetWriter {
    dir: PathBuf,
}

impl DatasetWriter {
    pub fn new(dir: &Path) -> Self {
        DatasetWriter { dir: dir.into() }
    }

    pub fn write(
        &self,
        items: &[DatasetItem],
        labels: &LabelIndex,
        split: &Split,
    ) -> anyhow::Result<DatasetResult> {
        self.write_partition(TRAIN, items, labels, &split.train)?;
        self.write_partition(VALIDATION, items, labels, &split.validation)?;
        info!(
            "dataset written to {:?}: {} train, {} validation, {} labels",
            self.dir,
            split.train.len(),
            split.validation.len(),
            labels.len()
        );
        Ok(DatasetResult {
            train: split.train.len(),
            validation: split.validation.len(),
            labels: labels.len(),
            dataset_dir: self.dir.clone(),
        })
    }

    fn write_partition(
        &self,
        name: &str,
        items: &[DatasetItem],
        labels: &LabelIndex,
        indices: &[usize],
    ) -> anyhow::Result<()> {
        let dir = self.dir.join(name);
        // the partition is rebuilt from scratch on every run
        if dir.exists() {
            fs::remove_dir_all(&dir).context(format!("could not clear {:?}", dir))?;
        }
        fs::create_dir_all(dir.join("images")).context(format!("could not create {:?}", dir))?;

        let meta_path = dir.join(METADATA_FILE);
        let mut meta = BufWriter::new(
            File::create(&meta_path).context(format!("could not create {:?}", meta_path))?,
        );

        for (n, &i) in indices.iter().enumerate() {
            let item = items
                .get(i)
                .ok_or_else(|| anyhow!("split index {} out of range", i))?;
            let label = labels
                .id(&item.title)
                .ok_or_else(|| anyhow!("no label for {}", item.title))?;
            let file = format!("images/{}.png", n);
            fs::rename(&item.staged, dir.join(&file)).context(format!(
                "could not move {:?} to {} image {}",
                item.staged, name, file
            ))?;

            let row = DatasetRow {
                file,
                label,
                label_name: item.title.clone(),
                image_id: item.image_id,
                pageid: item.pageid,
                title: item.title.clone(),
                text: item.text.clone(),
                summary: item.summary.clone(),
            };
            serde_json::to_writer(&mut meta, &row)?;
            meta.write_all(b"\n")?;
        }
        meta.flush()?;
        debug!("{} partition has {} examples", name, indices.len());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::read_jsonl;
    use image::{ImageFormat, RgbImage};

    fn item(staging: &Path, i: usize, title: &str) -> DatasetItem {
        let staged = staging.join(format!("{}_0.png", i));
        RgbImage::new(4, 4)
            .save_with_format(&staged, ImageFormat::Png)
            .unwrap();
        DatasetItem {
            record_index: i,
            position: 0,
            image_id: i as u64,
            pageid: 100 + i as u64,
            title: title.into(),
            text: None,
            summary: None,
            staged,
        }
    }

    #[test]
    fn missing_staged_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let items = vec![item(staging.path(), 0, "a")];
        std::fs::remove_file(&items[0].staged).unwrap();
        let labels = LabelIndex::from_labels(["a"]);
        let split = Split { train: vec![0], validation: vec![] };
        assert!(DatasetWriter::new(dir.path()).write(&items, &labels, &split).is_err());
    }

    #[test]
    fn writes_both_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let items = vec![
            item(staging.path(), 0, "a"),
            item(staging.path(), 1, "a"),
            item(staging.path(), 2, "b"),
        ];
        let labels = LabelIndex::from_labels(items.iter().map(|i| i.title.as_str()));
        let split = Split {
            train: vec![0, 2],
            validation: vec![1],
        };
        let res = DatasetWriter::new(dir.path()).write(&items, &labels, &split).unwrap();
        assert_eq!((res.train, res.validation, res.labels), (2, 1, 2));

        let train: Vec<DatasetRow> = read_jsonl(&dir.path().join(TRAIN).join(METADATA_FILE)).unwrap();
        assert_eq!(train.len(), 2);
        assert_eq!(train[1].label, 1);
        assert_eq!(train[1].label_name, "b");
        assert!(dir.path().join(TRAIN).join(&train[1].file).exists());
        assert!(!items[2].staged.exists());

        let val: Vec<DatasetRow> = read_jsonl(&dir.path().join(VALIDATION).join(METADATA_FILE)).unwrap();
        assert_eq!(val[0].pageid, 101);
        assert_eq!(val[0].label, 0);
    }

    #[test]
    fn rewrites_partitions_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let stage = || vec![item(staging.path(), 0, "a"), item(staging.path(), 1, "a")];
        let labels = LabelIndex::from_labels(["a"]);
        let writer = DatasetWriter::new(dir.path());
        writer
            .write(&stage(), &labels, &Split { train: vec![0, 1], validation: vec![] })
            .unwrap();
        let items = stage();
        writer
            .write(&items, &labels, &Split { train: vec![0], validation: vec![1] })
            .unwrap();
        assert!(!dir.path().join(TRAIN).join("images/1.png").exists());
        assert!(dir.path().join(VALIDATION).join("images/0.png").exists());
    }
}
