//! Builds the suite tree from the formatter's flat example list.
//!
//! Shape: root -> one group per immediate subdirectory of the spec root
//! (sorted by label) -> one group per file -> examples in reported order.
//! Files sitting directly in the spec root become top-level file groups
//! after the directory groups, in first-seen order.

use crate::config::Config;
use crate::label::{
    location_key, pascal_case, positions, strip_file_prefix, ANONYMOUS_EXAMPLE_PREFIX,
};
use crate::types::{RawTestRecord, TestGroup, TestLeaf};
use std::path::{Path, PathBuf};

/// Settings the builder needs from the configuration.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    spec_directory: String,
    project_root: PathBuf,
    spec_file_suffix: String,
}

impl TreeBuilder {
    pub fn new(
        spec_directory: impl Into<String>,
        project_root: impl Into<PathBuf>,
        spec_file_suffix: impl Into<String>,
    ) -> Self {
        Self {
            spec_directory: spec_directory.into(),
            project_root: project_root.into(),
            spec_file_suffix: spec_file_suffix.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.spec_directory.clone(),
            config.project_root.clone(),
            config.spec_file_suffix.clone(),
        )
    }

    /// Build the whole tree.
    pub fn build_root_suite(&self, records: &[RawTestRecord]) -> TestGroup {
        let mut files: Vec<&str> = Vec::new();
        for record in records {
            if !files.contains(&record.file_path.as_str()) {
                files.push(&record.file_path);
            }
        }

        let placed: Vec<(&str, Option<&str>)> = files
            .iter()
            .map(|file| (*file, self.owning_directory(*file)))
            .collect();

        let mut directories: Vec<&str> = Vec::new();
        for (_, directory) in &placed {
            if let Some(directory) = *directory {
                if !directories.contains(&directory) {
                    directories.push(directory);
                }
            }
        }

        let mut directory_groups: Vec<TestGroup> = directories
            .iter()
            .map(|directory| {
                let mut group = TestGroup::new(*directory, *directory);
                group.children = placed
                    .iter()
                    .filter(|(_, owner)| owner == &Some(*directory))
                    .map(|(file, _)| self.build_file_suite(records, file, Some(*directory)).into())
                    .collect();
                group
            })
            .collect();
        directory_groups.sort_by(|a, b| a.label.cmp(&b.label));

        let mut root = TestGroup::root();
        root.children = directory_groups.into_iter().map(Into::into).collect();
        root.children.extend(
            placed
                .iter()
                .filter(|(_, owner)| owner.is_none())
                .map(|(file, _)| self.build_file_suite(records, file, None).into()),
        );
        root
    }

    /// Build the group for one file, keeping the reported example order.
    pub fn build_file_suite(
        &self,
        records: &[RawTestRecord],
        current_file: &str,
        directory: Option<&str>,
    ) -> TestGroup {
        let label = self.file_label(current_file, directory);
        let class_label = pascal_case(
            label
                .strip_suffix(self.spec_file_suffix.as_str())
                .unwrap_or(&label),
        );

        let mut group = TestGroup::new(current_file, label.clone());
        group.file = Some(self.absolute_path(current_file));
        group.children = records
            .iter()
            .filter(|record| record.file_path == current_file)
            .map(|record| self.build_leaf(record, &class_label).into())
            .collect();
        group
    }

    fn build_leaf(&self, record: &RawTestRecord, class_label: &str) -> TestLeaf {
        let label = if record.description.starts_with(ANONYMOUS_EXAMPLE_PREFIX) {
            let position = positions(&record.id).last().copied().unwrap_or_default();
            format!("{}test #{position}", record.full_description)
        } else {
            record.full_description.clone()
        };

        TestLeaf {
            id: record.id.clone(),
            label: strip_file_prefix(class_label, &label),
            file: self.absolute_path(&record.file_path),
            line: record.line_number.saturating_sub(1),
            location: location_key(&record.id),
        }
    }

    /// First path segment below the spec root, if the file is nested.
    fn owning_directory<'a>(&self, file: &'a str) -> Option<&'a str> {
        let relative = file.strip_prefix(self.spec_directory.as_str())?;
        match relative.split_once('/') {
            Some((directory, rest)) if !directory.is_empty() && !rest.is_empty() => {
                Some(directory)
            }
            _ => None,
        }
    }

    fn file_label(&self, file: &str, directory: Option<&str>) -> String {
        let prefix = match directory {
            Some(directory) => format!("{}{directory}/", self.spec_directory),
            None => self.spec_directory.clone(),
        };
        file.strip_prefix(prefix.as_str()).unwrap_or(file).to_string()
    }

    /// `./spec/a_spec.rb` -> `<project_root>/spec/a_spec.rb`.
    fn absolute_path(&self, file: &str) -> PathBuf {
        let relative = file.strip_prefix('.').unwrap_or(file).trim_start_matches('/');
        join_relative(&self.project_root, relative)
    }
}

fn join_relative(root: &Path, relative: &str) -> PathBuf {
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}
