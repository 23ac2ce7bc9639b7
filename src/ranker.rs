//! Query answering over the trained model and the document store.
//!
//! A query is normalized and encoded like a training document, its nearest
//! centroid is predicted, and a random sample of stored documents is scored
//! against it by cosine similarity.

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    checkpoint::Snapshot,
    clusterer::ClusterModel,
    document_store::{Document, DocumentStore},
    encoder::{FeatureEncoder, cosine_similarity},
    error::{Error, Result},
    normalizer,
};

/// Documents scored per query.
pub const CANDIDATE_SAMPLE: usize = 1000;
/// Results returned per query.
pub const TOP_K: usize = 5;

/// Where candidates for a query are drawn from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CandidatePolicy {
    /// Uniformly from the whole store.
    #[default]
    Uniform,
    /// From the members of the predicted cluster, or uniformly when it has
    /// none.
    PredictedCluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankedDocument {
    pub id: u64,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub cluster: usize,
    /// At most [`TOP_K`] entries, best first.
    pub documents: Vec<RankedDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerSource {
    pub id: u64,
    pub score: f32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub query: String,
    pub cluster: usize,
    pub sources: Vec<AnswerSource>,
    pub text: String,
}

pub struct QueryRanker<'a> {
    encoder: FeatureEncoder,
    clusters: &'a ClusterModel,
    processed_documents: u64,
    store: &'a DocumentStore,
    policy: CandidatePolicy,
}

impl<'a> QueryRanker<'a> {
    pub fn new(
        encoder: FeatureEncoder,
        clusters: &'a ClusterModel,
        processed_documents: u64,
        store: &'a DocumentStore,
    ) -> Self {
        Self {
            encoder,
            clusters,
            processed_documents,
            store,
            policy: CandidatePolicy::default(),
        }
    }

    pub fn from_snapshot(
        snapshot: &'a Snapshot,
        store: &'a DocumentStore,
    ) -> Self {
        Self::new(
            snapshot.encoder,
            &snapshot.clusters,
            snapshot.progress.processed_documents,
            store,
        )
    }

    pub fn with_policy(mut self, policy: CandidatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_trained(&self) -> bool {
        self.processed_documents > 0 && self.clusters.is_fitted()
    }

    /// Score a random candidate sample against `query`.
    ///
    /// Candidates whose similarity is undefined (an all-zero vector on either
    /// side) are left out, so an empty query yields no documents.
    pub fn rank(&self, query: &str) -> Result<QueryResult> {
        if !self.is_trained() {
            return Err(Error::NotTrained);
        }

        let query_vector = self.encoder.encode(&normalizer::normalize(query));
        let cluster = self.clusters.predict(&query_vector)?;
        let candidates = self.candidates(cluster)?;

        let mut documents: Vec<RankedDocument> = candidates
            .par_iter()
            .filter_map(|doc| {
                let vector = self.encoder.encode(&doc.content);
                cosine_similarity(&query_vector, &vector).map(|score| {
                    RankedDocument { id: doc.id, score }
                })
            })
            .collect();
        documents.sort_by(|a, b| {
            b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id))
        });
        documents.truncate(TOP_K);

        debug!(
            cluster,
            candidates = candidates.len(),
            results = documents.len(),
            "ranked query"
        );
        Ok(QueryResult { cluster, documents })
    }

    fn candidates(&self, cluster: usize) -> Result<Vec<Document>> {
        if self.policy == CandidatePolicy::PredictedCluster {
            let members =
                self.store.sample_from_cluster(cluster, CANDIDATE_SAMPLE)?;
            if !members.is_empty() {
                return Ok(members);
            }
            debug!(cluster, "predicted cluster is empty, sampling uniformly");
        }
        self.store.sample_random(CANDIDATE_SAMPLE)
    }

    /// Rank `query`, fetch the matching contents and render a reply.
    pub fn answer(&self, query: &str) -> Result<Answer> {
        info!(query, "answering query");
        let ranked = self.rank(query)?;

        let ids: Vec<u64> = ranked.documents.iter().map(|d| d.id).collect();
        let contents = self.store.get_many(&ids)?;
        let sources: Vec<AnswerSource> = ranked
            .documents
            .iter()
            .filter_map(|r| {
                contents.iter().find(|d| d.id == r.id).map(|d| AnswerSource {
                    id: r.id,
                    score: r.score,
                    content: d.content.clone(),
                })
            })
            .collect();

        Ok(Answer {
            query: query.to_string(),
            cluster: ranked.cluster,
            text: render_answer(query, &sources),
            sources,
        })
    }
}

impl std::fmt::Debug for QueryRanker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRanker")
            .field("processed_documents", &self.processed_documents)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn render_answer(query: &str, sources: &[AnswerSource]) -> String {
    if sources.is_empty() {
        return "No relevant information was found for your question."
            .to_string();
    }
    let mut text = format!(
        "Based on your question '{query}', the most relevant entries are:\n\n"
    );
    for source in sources {
        text.push_str("- ");
        text.push_str(&source.content);
        text.push('\n');
    }
    text
}
