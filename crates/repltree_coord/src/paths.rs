//! Fixed node layout for one replicated table.
//!
//! Everything lives under the table root:
//! `metadata`, `columns`, `log/`, `blocks/`, `block_numbers/<partition>/`,
//! `quorum/{status,last_part/}`, `mutations/`, `leader_election/`,
//! `replicas/<replica>/{is_active,host,log_pointer,queue/,parts/,columns,
//! metadata_version,mutation_pointer,flags/,is_lost}`.

/// Path builder rooted at one table's coordinator subtree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TablePaths {
    root: String,
}

impl TablePaths {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn metadata(&self) -> String {
        format!("{}/metadata", self.root)
    }

    pub fn columns(&self) -> String {
        format!("{}/columns", self.root)
    }

    pub fn log_dir(&self) -> String {
        format!("{}/log", self.root)
    }

    /// Sequential log children are named `log-NNNNNNNNNN`.
    pub fn log_entry_prefix(&self) -> String {
        format!("{}/log/log-", self.root)
    }

    pub fn log_entry(&self, index: u64) -> String {
        format!("{}/log/log-{:010}", self.root, index)
    }

    pub fn blocks_dir(&self) -> String {
        format!("{}/blocks", self.root)
    }

    pub fn block(&self, block_id: &str) -> String {
        format!("{}/blocks/{}", self.root, block_id)
    }

    pub fn block_numbers_dir(&self) -> String {
        format!("{}/block_numbers", self.root)
    }

    pub fn partition_block_numbers(&self, partition_id: &str) -> String {
        format!("{}/block_numbers/{}", self.root, partition_id)
    }

    pub fn partition_block_prefix(&self, partition_id: &str) -> String {
        format!("{}/block_numbers/{}/block-", self.root, partition_id)
    }

    pub fn quorum_dir(&self) -> String {
        format!("{}/quorum", self.root)
    }

    pub fn quorum_status(&self) -> String {
        format!("{}/quorum/status", self.root)
    }

    pub fn quorum_last_part_dir(&self) -> String {
        format!("{}/quorum/last_part", self.root)
    }

    pub fn quorum_last_part(&self, partition_id: &str) -> String {
        format!("{}/quorum/last_part/{}", self.root, partition_id)
    }

    pub fn mutations_dir(&self) -> String {
        format!("{}/mutations", self.root)
    }

    /// Sequential mutation children are named `mutation-NNNNNNNNNN`.
    pub fn mutation_prefix(&self) -> String {
        format!("{}/mutations/mutation-", self.root)
    }

    pub fn leader_election_dir(&self) -> String {
        format!("{}/leader_election", self.root)
    }

    pub fn leader_election_prefix(&self) -> String {
        format!("{}/leader_election/leader_election-", self.root)
    }

    pub fn replicas_dir(&self) -> String {
        format!("{}/replicas", self.root)
    }

    pub fn replica(&self, replica: &str) -> String {
        format!("{}/replicas/{}", self.root, replica)
    }

    pub fn is_active(&self, replica: &str) -> String {
        format!("{}/replicas/{}/is_active", self.root, replica)
    }

    pub fn host(&self, replica: &str) -> String {
        format!("{}/replicas/{}/host", self.root, replica)
    }

    pub fn log_pointer(&self, replica: &str) -> String {
        format!("{}/replicas/{}/log_pointer", self.root, replica)
    }

    pub fn queue_dir(&self, replica: &str) -> String {
        format!("{}/replicas/{}/queue", self.root, replica)
    }

    pub fn queue_entry_prefix(&self, replica: &str) -> String {
        format!("{}/replicas/{}/queue/queue-", self.root, replica)
    }

    pub fn parts_dir(&self, replica: &str) -> String {
        format!("{}/replicas/{}/parts", self.root, replica)
    }

    pub fn part(&self, replica: &str, part_name: &str) -> String {
        format!("{}/replicas/{}/parts/{}", self.root, replica, part_name)
    }

    pub fn replica_columns(&self, replica: &str) -> String {
        format!("{}/replicas/{}/columns", self.root, replica)
    }

    pub fn replica_metadata_version(&self, replica: &str) -> String {
        format!("{}/replicas/{}/metadata_version", self.root, replica)
    }

    pub fn mutation_pointer(&self, replica: &str) -> String {
        format!("{}/replicas/{}/mutation_pointer", self.root, replica)
    }

    pub fn flags_dir(&self, replica: &str) -> String {
        format!("{}/replicas/{}/flags", self.root, replica)
    }

    pub fn is_lost(&self, replica: &str) -> String {
        format!("{}/replicas/{}/is_lost", self.root, replica)
    }
}

/// Extract the sequential index from a child name like `log-0000000042`.
pub fn sequential_index(name: &str) -> Option<u64> {
    let (_, digits) = name.rsplit_once('-')?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_normalized() {
        let paths = TablePaths::new("/tables/db/visits/");
        assert_eq!(paths.root(), "/tables/db/visits");
        assert_eq!(paths.log_entry(7), "/tables/db/visits/log/log-0000000007");
    }

    #[test]
    fn sequential_index_parses_padded_names() {
        assert_eq!(sequential_index("log-0000000042"), Some(42));
        assert_eq!(sequential_index("queue-0000000000"), Some(0));
        assert_eq!(sequential_index("not_sequential"), None);
    }
}
