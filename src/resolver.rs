use std::path::Path;

use crate::archive::RemoteArchive;
use crate::error::CsdmError;
use crate::progress::{ProgressHandle, ProgressRecord, Stage};
use crate::timeutil::{DateRange, granule_timestamp};

pub struct SeededRecords {
    pub download: ProgressHandle,
    pub parse: ProgressHandle,
}

pub struct TargetResolver<'a, A: ?Sized> {
    archive: &'a A,
}

impl<'a, A: RemoteArchive + ?Sized> TargetResolver<'a, A> {
    pub fn new(archive: &'a A) -> Self {
        Self { archive }
    }

    /// Directory of `product` on the archive.
    ///
    /// Several matches resolve to the first in sorted order, with a warning.
    pub fn locate(&self, product: &str) -> Result<String, CsdmError> {
        let mut matches = self.archive.search_sub_dir(product)?;
        matches.sort();
        matches.dedup();
        let Some(first) = matches.first().cloned() else {
            return Err(CsdmError::ProductNotFound(product.to_string()));
        };
        if matches.len() > 1 {
            tracing::warn!(
                product,
                chosen = %first,
                candidates = matches.len(),
                "product name matched several archive directories; using the first"
            );
        }
        Ok(first)
    }

    pub fn resolve(&self, product: &str, range: &DateRange) -> Result<Vec<String>, CsdmError> {
        let dir = self.locate(product)?;
        let mut candidates = self
            .archive
            .list_range(&dir, range)?
            .into_iter()
            .filter(|path| range.contains_path(path))
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| {
            granule_timestamp(a)
                .cmp(&granule_timestamp(b))
                .then_with(|| a.cmp(b))
        });
        candidates.dedup();
        tracing::info!(product, %range, dir = %dir, files = candidates.len(), "resolved targets");
        Ok(candidates)
    }

    /// Resolves the target set and overwrites both stage records with it.
    pub fn seed(
        &self,
        product: &str,
        range: &DateRange,
        download_path: &Path,
        parse_path: &Path,
    ) -> Result<SeededRecords, CsdmError> {
        let candidates = self.resolve(product, range)?;
        let download = ProgressHandle::create(
            download_path,
            Stage::Download,
            ProgressRecord::seed(&candidates),
        )?;
        let parse =
            ProgressHandle::create(parse_path, Stage::Parse, ProgressRecord::seed(&candidates))?;
        Ok(SeededRecords { download, parse })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    struct FakeArchive {
        dirs: Vec<String>,
        files: Vec<String>,
        searches: Mutex<usize>,
    }

    impl RemoteArchive for FakeArchive {
        fn search_sub_dir(&self, _name: &str) -> Result<Vec<String>, CsdmError> {
            *self.searches.lock().unwrap() += 1;
            Ok(self.dirs.clone())
        }

        fn file_list(&self, _dir: &str) -> Result<Vec<String>, CsdmError> {
            Ok(self.files.clone())
        }

        fn fetch_file(&self, _remote_path: &str, _local_dir: &Path) -> Result<u64, CsdmError> {
            Ok(0)
        }
    }

    fn range() -> DateRange {
        "2012-02-03T00:00:00..2012-02-04T00:00:00".parse().unwrap()
    }

    #[test]
    fn no_match_is_product_not_found() {
        let archive = FakeArchive {
            dirs: Vec::new(),
            files: Vec::new(),
            searches: Mutex::new(0),
        };
        let resolver = TargetResolver::new(&archive);
        assert_matches!(
            resolver.resolve("2B-GEOPROF.P1_R05", &range()),
            Err(CsdmError::ProductNotFound(_))
        );
    }

    #[test]
    fn ambiguous_match_picks_first_sorted() {
        let archive = FakeArchive {
            dirs: vec![
                "/Data/b/2B-GEOPROF.P1_R05".to_string(),
                "/Data/a/2B-GEOPROF.P1_R05".to_string(),
            ],
            files: Vec::new(),
            searches: Mutex::new(0),
        };
        let resolver = TargetResolver::new(&archive);
        assert_eq!(
            resolver.locate("2B-GEOPROF.P1_R05").unwrap(),
            "/Data/a/2B-GEOPROF.P1_R05"
        );
    }

    #[test]
    fn seeded_records_share_the_filtered_target_set() {
        let archive = FakeArchive {
            dirs: vec!["/Data/2B-GEOPROF.P1_R05".to_string()],
            files: vec![
                "/Data/2B-GEOPROF.P1_R05/2012/033/2012033000000_30670_CS.hdf".to_string(),
                "/Data/2B-GEOPROF.P1_R05/2012/034/2012034161842_30691_CS.hdf".to_string(),
                "/Data/2B-GEOPROF.P1_R05/2012/035/2012035010203_30700_CS.hdf".to_string(),
                "/Data/2B-GEOPROF.P1_R05/2012/036/2012036000000_30715_CS.hdf".to_string(),
            ],
            searches: Mutex::new(0),
        };
        let temp = tempfile::tempdir().unwrap();
        let resolver = TargetResolver::new(&archive);
        let seeded = resolver
            .seed(
                "2B-GEOPROF.P1_R05",
                &range(),
                &temp.path().join("d.json"),
                &temp.path().join("p.json"),
            )
            .unwrap();

        let download = seeded.download.snapshot().unwrap();
        let parse = seeded.parse.snapshot().unwrap();
        assert_eq!(download.to_do(), parse.to_do());
        assert_eq!(download.to_do().len(), 2);
        assert!(download.done().is_empty());
        assert_eq!(download.progress(), 0.0);
        assert_eq!(*archive.searches.lock().unwrap(), 1);
    }

    #[test]
    fn targets_follow_acquisition_order() {
        let archive = FakeArchive {
            dirs: vec!["/Data/2B-GEOPROF.P1_R05".to_string()],
            files: vec![
                "/Data/2B-GEOPROF.P1_R05/2012/035/2012035010203_30700_CS.hdf".to_string(),
                "/Data/2B-GEOPROF.P1_R05/2012/034/2012034175735_30692_CS.hdf".to_string(),
                "/Data/2B-GEOPROF.P1_R05/2012/034/2012034161842_30691_CS.hdf".to_string(),
                "/Data/2B-GEOPROF.P1_R05/2012/034/2012034161842_30691_CS.hdf".to_string(),
            ],
            searches: Mutex::new(0),
        };
        let targets = TargetResolver::new(&archive)
            .resolve("2B-GEOPROF.P1_R05", &range())
            .unwrap();
        let names = targets
            .iter()
            .map(|path| path.rsplit('/').next().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "2012034161842_30691_CS.hdf",
                "2012034175735_30692_CS.hdf",
                "2012035010203_30700_CS.hdf",
            ]
        );
    }
}
