//! Id lists
//!
//! An id list has one sample per line: an image path and, for labeled and
//! validation splits, a mask path, separated by whitespace. Paths are
//! relative to the dataset root.
//!
//! ```text
//! JPEGImages/2007_000032.jpg SegmentationClass/2007_000032.png
//! ```

use std::fs;
use std::path::Path;

use crate::utils::error::{Result, SegMixError};

/// One line of an id list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleId {
    pub image: String,
    pub mask: Option<String>,
}

impl SampleId {
    /// Parse a non-empty id line
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let image = parts
            .next()
            .ok_or_else(|| SegMixError::Dataset("empty id line".to_string()))?
            .to_string();
        let mask = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(SegMixError::Dataset(format!(
                "id line has more than two fields: '{}'",
                line
            )));
        }
        Ok(Self { image, mask })
    }

    /// Stem of the image path, used to name the sample in logs
    pub fn name(&self) -> &str {
        let file = self.image.rsplit('/').next().unwrap_or(&self.image);
        file.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(file)
    }
}

/// Read an id list, skipping blank lines
pub fn read_id_list(path: &Path) -> Result<Vec<SampleId>> {
    if !path.exists() {
        return Err(SegMixError::PathNotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let ids = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(SampleId::parse)
        .collect::<Result<Vec<_>>>()?;

    if ids.is_empty() {
        return Err(SegMixError::Dataset(format!(
            "id list {} is empty",
            path.display()
        )));
    }
    Ok(ids)
}

/// Repeat `ids` until it holds `nsample` entries (at least the original list).
///
/// The list is repeated `ceil(nsample / len)` times and then truncated to
/// `nsample`, so every labeled sample appears as evenly as possible.
pub fn oversample<T: Clone>(ids: &[T], nsample: usize) -> Vec<T> {
    if ids.is_empty() || nsample <= ids.len() {
        return ids.to_vec();
    }
    let repeats = nsample.div_ceil(ids.len());
    let mut out: Vec<T> = ids
        .iter()
        .cloned()
        .cycle()
        .take(ids.len() * repeats)
        .collect();
    out.truncate(nsample);
    out
}

/// Normalise one line of a partition file to the dataset layout.
///
/// Absolute-looking image paths lose their leading slash and the augmented
/// mask directory is mapped to the plain one.
pub fn rewrite_id_line(line: &str) -> String {
    line.trim()
        .replace("/JPEGImages", "JPEGImages")
        .replace("/SegmentationClassAug", "SegmentationClass")
}

/// Rewrite a whole partition file; returns the number of lines written
pub fn rewrite_id_file(input: &Path, output: &Path) -> Result<usize> {
    let content = fs::read_to_string(input)?;
    let lines: Vec<String> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(rewrite_id_line)
        .collect();

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    fs::write(output, out)?;
    Ok(lines.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_labeled_and_unlabeled() {
        let labeled =
            SampleId::parse("JPEGImages/2007_000032.jpg SegmentationClass/2007_000032.png").unwrap();
        assert_eq!(labeled.image, "JPEGImages/2007_000032.jpg");
        assert_eq!(labeled.mask.as_deref(), Some("SegmentationClass/2007_000032.png"));
        assert_eq!(labeled.name(), "2007_000032");

        let unlabeled = SampleId::parse("leftImg8bit/train/aachen_000000.png").unwrap();
        assert!(unlabeled.mask.is_none());
        assert!(SampleId::parse("a b c").is_err());
    }

    #[test]
    fn test_oversample_repeats_then_truncates() {
        let ids = vec![1, 2, 3];
        assert_eq!(oversample(&ids, 7), vec![1, 2, 3, 1, 2, 3, 1]);
        assert_eq!(oversample(&ids, 2), vec![1, 2, 3]);
        assert_eq!(oversample(&ids, 6), vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_rewrite_line() {
        assert_eq!(
            rewrite_id_line("/JPEGImages/2007_000032.jpg /SegmentationClassAug/2007_000032.png"),
            "JPEGImages/2007_000032.jpg SegmentationClass/2007_000032.png"
        );
        // already rewritten lines are left alone
        assert_eq!(
            rewrite_id_line("JPEGImages/a.jpg SegmentationClass/a.png"),
            "JPEGImages/a.jpg SegmentationClass/a.png"
        );
    }

    #[test]
    fn test_rewrite_file_drops_blank_lines() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("5291_train_unsupervised.txt");
        fs::write(
            &input,
            "/JPEGImages/a.jpg /SegmentationClassAug/a.png\n\n/JPEGImages/b.jpg /SegmentationClassAug/b.png\n",
        )
        .unwrap();

        let output = dir.path().join("unlabeled.txt");
        assert_eq!(rewrite_id_file(&input, &output).unwrap(), 2);

        let ids = read_id_list(&output).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1].mask.as_deref(), Some("SegmentationClass/b.png"));
    }

    #[test]
    fn test_missing_id_list() {
        let err = read_id_list(Path::new("/nonexistent/labeled.txt")).unwrap_err();
        assert!(matches!(err, SegMixError::PathNotFound(_)));
    }
}
