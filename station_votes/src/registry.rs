use std::collections::BTreeMap;

use log::debug;

use crate::*;

/// The catalog of epoch configurations, validated once.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct EpochRegistry {
    configs: BTreeMap<Epoch, EpochConfig>,
}

impl EpochRegistry {
    /// Validates the configurations and builds the registry.
    ///
    /// Every problem that would otherwise surface deep in row processing is reported
    /// here: missing vote columns, header labels without a header row, borrowed
    /// directories pointing nowhere.
    pub fn new(configs: Vec<EpochConfig>) -> Result<EpochRegistry, ConfigurationError> {
        let (registry, rejected) = EpochRegistry::partition(configs);
        let first = rejected.into_iter().next();
        match first {
            Some((_, err)) => Err(err),
            None => Ok(registry),
        }
    }

    /// Like [`EpochRegistry::new`], but keeps the valid entries.
    ///
    /// A configuration error only takes its own epoch out of the run. Duplicated epochs
    /// keep their first definition.
    pub fn partition(
        configs: Vec<EpochConfig>,
    ) -> (EpochRegistry, Vec<(Epoch, ConfigurationError)>) {
        let mut res: BTreeMap<Epoch, EpochConfig> = BTreeMap::new();
        let mut rejected: Vec<(Epoch, ConfigurationError)> = Vec::new();
        for c in configs {
            let epoch = c.epoch;
            if let Err(e) = check_config(&c) {
                rejected.push((epoch, e));
            } else if res.contains_key(&epoch) {
                rejected.push((epoch, ConfigurationError::DuplicateEpoch(epoch)));
            } else {
                res.insert(epoch, c);
            }
        }
        let broken_borrows: Vec<(Epoch, Epoch)> = res
            .values()
            .filter_map(|c| match c.directory {
                DirectorySource::Borrowed(from) => match res.get(&from).map(|o| &o.directory) {
                    Some(DirectorySource::Table(_)) => None,
                    _ => Some((c.epoch, from)),
                },
                _ => None,
            })
            .collect();
        for (epoch, from) in broken_borrows {
            res.remove(&epoch);
            rejected.push((epoch, ConfigurationError::BorrowedDirectory { epoch, from }));
        }
        debug!(
            "EpochRegistry::partition: {} epochs, {} rejected",
            res.len(),
            rejected.len()
        );
        (EpochRegistry { configs: res }, rejected)
    }

    pub fn get_config(&self, epoch: Epoch) -> Result<&EpochConfig, ConfigurationError> {
        self.configs
            .get(&epoch)
            .ok_or(ConfigurationError::UnknownEpoch(epoch))
    }

    /// All the epochs, in increasing order.
    pub fn epochs(&self) -> Vec<Epoch> {
        self.configs.keys().cloned().collect()
    }

    /// The directory used by an epoch, along with the epoch that publishes it.
    pub fn directory_for(
        &self,
        epoch: Epoch,
    ) -> Result<Option<(Epoch, &DirectoryLayout)>, ConfigurationError> {
        let config = self.get_config(epoch)?;
        match &config.directory {
            DirectorySource::Table(layout) => Ok(Some((epoch, layout))),
            DirectorySource::Borrowed(from) => match &self.get_config(*from)?.directory {
                DirectorySource::Table(layout) => Ok(Some((*from, layout))),
                _ => Err(ConfigurationError::BorrowedDirectory { epoch, from: *from }),
            },
            DirectorySource::Missing => Ok(None),
        }
    }
}

fn check_table(
    epoch: Epoch,
    source: &TableSource,
    roles: &[(ColumnRole, &ColumnRef)],
) -> Result<(), ConfigurationError> {
    if source.header_row.is_some() {
        return Ok(());
    }
    for (_, cref) in roles.iter() {
        if let ColumnRef::Label(label) = cref {
            return Err(ConfigurationError::LabelWithoutHeader {
                epoch,
                label: label.clone(),
            });
        }
    }
    Ok(())
}

fn check_config(c: &EpochConfig) -> Result<(), ConfigurationError> {
    if c.results.vote_columns.is_empty() {
        return Err(ConfigurationError::NoVoteColumns(c.epoch));
    }
    check_table(c.epoch, &c.results.source, &c.results.roles())?;
    if let DirectorySource::Table(layout) = &c.directory {
        check_table(c.epoch, &layout.source, &layout.roles())?;
    }
    Ok(())
}

/// Finds the physical position of every role.
///
/// Arguments:
/// * `headers` the labels of the header row, if the table has one. Labels are
/// compared after trimming, since historical sheets carry stray spaces.
pub fn resolve_columns(
    epoch: Epoch,
    roles: &[(ColumnRole, &ColumnRef)],
    headers: Option<&[String]>,
) -> Result<Vec<(ColumnRole, usize)>, ConfigurationError> {
    let mut res: Vec<(ColumnRole, usize)> = Vec::new();
    for (role, cref) in roles.iter() {
        let idx = match cref {
            ColumnRef::Index(idx) => *idx,
            ColumnRef::Label(label) => {
                let hs = headers.ok_or_else(|| ConfigurationError::LabelWithoutHeader {
                    epoch,
                    label: label.clone(),
                })?;
                hs.iter()
                    .position(|h| h.trim() == label.trim())
                    .ok_or_else(|| ConfigurationError::UnknownHeader {
                        epoch,
                        label: label.clone(),
                    })?
            }
        };
        res.push((*role, idx));
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn source(header_row: Option<usize>) -> TableSource {
        TableSource {
            path: PathBuf::from("t.xlsx"),
            sheet: None,
            header_row,
            skip_rows: 0,
        }
    }

    fn config(epoch: u32, directory: DirectorySource) -> EpochConfig {
        EpochConfig {
            epoch: Epoch(epoch),
            results: ResultsLayout {
                source: source(Some(0)),
                locality: ColumnRef::Label("סמל ישוב".to_string()),
                station: ColumnRef::Label("קלפי".to_string()),
                vote_columns: vec![VoteColumn {
                    column: ColumnRef::Label("מחל".to_string()),
                    bloc: "Right".to_string(),
                    party: Some("מחל".to_string()),
                }],
                scale: ScaleFactors::IDENTITY,
            },
            sentinel: Some(9999),
            directory,
        }
    }

    fn directory_table() -> DirectorySource {
        DirectorySource::Table(DirectoryLayout {
            source: source(None),
            locality: ColumnRef::Index(2),
            station: ColumnRef::Index(4),
            locality_name: ColumnRef::Index(1),
            address_name: ColumnRef::Index(6),
            scale: ScaleFactors::IDENTITY,
        })
    }

    #[test]
    fn unknown_epoch() {
        let registry = EpochRegistry::new(vec![config(25, directory_table())]).unwrap();
        assert!(registry.get_config(Epoch(25)).is_ok());
        assert_eq!(
            registry.get_config(Epoch(26)),
            Err(ConfigurationError::UnknownEpoch(Epoch(26)))
        );
    }

    #[test]
    fn borrowed_directories() {
        let registry = EpochRegistry::new(vec![
            config(14, directory_table()),
            config(13, DirectorySource::Borrowed(Epoch(14))),
            config(12, DirectorySource::Missing),
        ])
        .unwrap();
        assert_eq!(registry.epochs(), vec![Epoch(12), Epoch(13), Epoch(14)]);
        let (from, _) = registry.directory_for(Epoch(13)).unwrap().unwrap();
        assert_eq!(from, Epoch(14));
        assert!(registry.directory_for(Epoch(12)).unwrap().is_none());

        let err = EpochRegistry::new(vec![
            config(12, DirectorySource::Missing),
            config(13, DirectorySource::Borrowed(Epoch(12))),
        ]);
        assert_eq!(
            err,
            Err(ConfigurationError::BorrowedDirectory {
                epoch: Epoch(13),
                from: Epoch(12)
            })
        );
    }

    #[test]
    fn invalid_entries_only_reject_their_epoch() {
        let mut broken = config(21, directory_table());
        broken.results.vote_columns.clear();
        let (registry, rejected) = EpochRegistry::partition(vec![
            config(25, directory_table()),
            broken,
            config(20, DirectorySource::Borrowed(Epoch(21))),
        ]);
        assert_eq!(registry.epochs(), vec![Epoch(25)]);
        assert_eq!(
            rejected,
            vec![
                (Epoch(21), ConfigurationError::NoVoteColumns(Epoch(21))),
                (
                    Epoch(20),
                    ConfigurationError::BorrowedDirectory {
                        epoch: Epoch(20),
                        from: Epoch(21)
                    }
                ),
            ]
        );
    }

    #[test]
    fn invalid_entries_fail_fast() {
        let err = EpochRegistry::new(vec![config(25, directory_table()), config(25, directory_table())]);
        assert_eq!(err, Err(ConfigurationError::DuplicateEpoch(Epoch(25))));

        let mut c = config(25, directory_table());
        c.results.vote_columns.clear();
        assert_eq!(
            EpochRegistry::new(vec![c]),
            Err(ConfigurationError::NoVoteColumns(Epoch(25)))
        );

        let mut c = config(25, directory_table());
        c.results.source.header_row = None;
        assert!(matches!(
            EpochRegistry::new(vec![c]),
            Err(ConfigurationError::LabelWithoutHeader { .. })
        ));
    }

    #[test]
    fn columns_by_label_and_index() {
        let c = config(25, directory_table());
        let headers: Vec<String> = vec!["סמל ישוב ".to_string(), "קלפי".to_string(), "מחל".to_string()];
        let cols = resolve_columns(Epoch(25), &c.results.roles(), Some(&headers)).unwrap();
        assert_eq!(
            cols,
            vec![
                (ColumnRole::LocalityCode, 0),
                (ColumnRole::StationCode, 1),
                (ColumnRole::Votes(0), 2)
            ]
        );

        let short: Vec<String> = vec!["סמל ישוב".to_string()];
        assert_eq!(
            resolve_columns(Epoch(25), &c.results.roles(), Some(&short)),
            Err(ConfigurationError::UnknownHeader {
                epoch: Epoch(25),
                label: "קלפי".to_string()
            })
        );

        if let DirectorySource::Table(layout) = &c.directory {
            let cols = resolve_columns(Epoch(25), &layout.roles(), None).unwrap();
            assert_eq!(cols[3], (ColumnRole::AddressName, 6));
        }
    }

    #[test]
    fn scale_factor_parsing() {
        assert_eq!(ScaleFactor::from_factor(10.0), Some(ScaleFactor::Times(10)));
        assert_eq!(ScaleFactor::from_factor(1.0), Some(ScaleFactor::IDENTITY));
        assert_eq!(ScaleFactor::from_factor(0.1), Some(ScaleFactor::DividedBy(10)));
        assert_eq!(ScaleFactor::from_factor(2.5), None);
        assert_eq!(ScaleFactor::from_factor(0.3), None);
        assert_eq!(ScaleFactor::from_factor(0.0), None);
        assert_eq!(ScaleFactor::from_factor(-10.0), None);
    }
}
