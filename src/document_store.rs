use std::path::Path;

use rand::{Rng, seq::index};
use redb::{
    Database,
    MultimapTableDefinition,
    ReadableDatabase,
    ReadableMultimapTable,
    ReadableTable,
    TableDefinition,
};
use tracing::debug;

use crate::error::{Error, Result};

const DOCUMENTS: TableDefinition<u64, &str> = TableDefinition::new("documents");

/// Cluster index → ids of the documents assigned to it at insert time.
const CLUSTER_MEMBERS: MultimapTableDefinition<u32, u64> =
    MultimapTableDefinition::new("cluster_members");

/// blake3 digest of the content → id of the first document holding it.
const CONTENT_HASHES: TableDefinition<&[u8], u64> =
    TableDefinition::new("content_hashes");

/// What to do when appending content that is already stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Always insert a new record.
    #[default]
    Allow,
    /// Skip the insert and report the id of the existing record.
    SkipExisting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: u64,
    pub content: String,
}

/// Append-only store of normalized documents.
///
/// Ids start at 1 and are assigned contiguously by the store, so the highest
/// id is also the number of stored documents.
pub struct DocumentStore {
    db: Database,
    dedup: DedupPolicy,
}

impl DocumentStore {
    /// Open or create a document store at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use streamrank::DocumentStore;
    ///
    /// let path = tmp.path().join("documents.redb");
    /// let store = DocumentStore::open(&path).unwrap();
    /// let ids = store.append(&["hello world".to_string()]).unwrap();
    /// assert_eq!(ids, vec![1]);
    /// assert_eq!(store.len().unwrap(), 1);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.open_multimap_table(CLUSTER_MEMBERS)?;
        txn.open_table(CONTENT_HASHES)?;
        txn.commit()?;

        Ok(Self {
            db,
            dedup: DedupPolicy::default(),
        })
    }

    pub fn with_dedup(mut self, dedup: DedupPolicy) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn dedup(&self) -> DedupPolicy {
        self.dedup
    }

    /// Append documents in one transaction and return their ids in input
    /// order.
    pub fn append(&self, contents: &[String]) -> Result<Vec<u64>> {
        self.insert(contents, None)
    }

    /// Like [`append`](Self::append), also recording the cluster every
    /// document was assigned to. `clusters` must be parallel to `contents`.
    pub fn append_with_clusters(
        &self,
        contents: &[String],
        clusters: &[usize],
    ) -> Result<Vec<u64>> {
        if contents.len() != clusters.len() {
            return Err(Error::DimensionMismatch {
                expected: contents.len(),
                actual: clusters.len(),
            });
        }
        self.insert(contents, Some(clusters))
    }

    fn insert(
        &self,
        contents: &[String],
        clusters: Option<&[usize]>,
    ) -> Result<Vec<u64>> {
        if contents.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(contents.len());
        let mut skipped = 0usize;
        let txn = self.db.begin_write()?;
        {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut members = txn.open_multimap_table(CLUSTER_MEMBERS)?;
            let mut hashes = txn.open_table(CONTENT_HASHES)?;

            let mut next_id = match documents.last()? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };

            for (i, content) in contents.iter().enumerate() {
                let digest = blake3::hash(content.as_bytes());
                let existing = hashes.get(digest.as_bytes().as_slice())?;
                let existing = existing.map(|guard| guard.value());

                if let (Some(id), DedupPolicy::SkipExisting) =
                    (existing, self.dedup)
                {
                    ids.push(id);
                    skipped += 1;
                    continue;
                }

                let id = next_id;
                next_id += 1;
                documents.insert(id, content.as_str())?;
                if existing.is_none() {
                    hashes.insert(digest.as_bytes().as_slice(), id)?;
                }
                if let Some(clusters) = clusters {
                    members.insert(clusters[i] as u32, id)?;
                }
                ids.push(id);
            }
        }
        txn.commit()?;

        debug!(
            appended = ids.len() - skipped,
            skipped, "appended documents"
        );
        Ok(ids)
    }

    pub fn get(&self, id: u64) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table.get(id)?.map(|v| v.value().to_string()))
    }

    /// Fetch several documents in one transaction, skipping missing ids.
    pub fn get_many(&self, ids: &[u64]) -> Result<Vec<Document>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut docs = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(guard) = table.get(id)? {
                docs.push(Document {
                    id,
                    content: guard.value().to_string(),
                });
            }
        }
        Ok(docs)
    }

    /// Number of stored documents.
    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table.last()?.map_or(0, |(key, _)| key.value()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every document with an id above `keep`, along with its cluster
    /// membership and content hash. Returns how many were removed.
    pub fn truncate(&self, keep: u64) -> Result<u64> {
        let len = self.len()?;
        if len <= keep {
            return Ok(0);
        }

        let txn = self.db.begin_write()?;
        {
            let mut documents = txn.open_table(DOCUMENTS)?;
            documents.retain(|id, _| id <= keep)?;

            let mut hashes = txn.open_table(CONTENT_HASHES)?;
            hashes.retain(|_, id| id <= keep)?;

            let mut members = txn.open_multimap_table(CLUSTER_MEMBERS)?;
            let mut stale = Vec::new();
            for entry in members.iter()? {
                let (cluster, ids) = entry?;
                for id in ids {
                    let id = id?.value();
                    if id > keep {
                        stale.push((cluster.value(), id));
                    }
                }
            }
            for (cluster, id) in stale {
                members.remove(cluster, id)?;
            }
        }
        txn.commit()?;

        debug!(keep, removed = len - keep, "truncated document store");
        Ok(len - keep)
    }

    /// Up to `n` distinct documents drawn uniformly at random.
    pub fn sample_random(&self, n: usize) -> Result<Vec<Document>> {
        self.sample_random_with(&mut rand::rng(), n)
    }

    pub fn sample_random_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        n: usize,
    ) -> Result<Vec<Document>> {
        let total = usize::try_from(self.len()?).unwrap_or(usize::MAX);
        let amount = n.min(total);
        if amount == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<u64> = index::sample(rng, total, amount)
            .into_iter()
            .map(|i| i as u64 + 1)
            .collect();
        self.get_many(&ids)
    }

    /// Ids of the documents recorded as members of `cluster`.
    pub fn cluster_members(&self, cluster: usize) -> Result<Vec<u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_multimap_table(CLUSTER_MEMBERS)?;
        let mut ids = Vec::new();
        for id in table.get(cluster as u32)? {
            ids.push(id?.value());
        }
        Ok(ids)
    }

    /// Up to `n` documents drawn uniformly from the members of `cluster`.
    pub fn sample_from_cluster(
        &self,
        cluster: usize,
        n: usize,
    ) -> Result<Vec<Document>> {
        self.sample_from_cluster_with(&mut rand::rng(), cluster, n)
    }

    pub fn sample_from_cluster_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        cluster: usize,
        n: usize,
    ) -> Result<Vec<Document>> {
        let members = self.cluster_members(cluster)?;
        let amount = n.min(members.len());
        if amount == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<u64> = index::sample(rng, members.len(), amount)
            .into_iter()
            .map(|i| members[i])
            .collect();
        self.get_many(&ids)
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("dedup", &self.dedup)
            .finish_non_exhaustive()
    }
}
