//! Annotation service: batch create, soft delete, filtered listing

use chrono::Utc;
use uuid::Uuid;

use crate::domain::annotation::Annotation;
use crate::error::ApiError;
use crate::storage::{AnnotationFilter, CompletionStore, RelationalStorage};

pub struct AnnotationService {
    relational: RelationalStorage,
    completions: CompletionStore,
}

impl AnnotationService {
    pub fn new(relational: RelationalStorage, completions: CompletionStore) -> Self {
        Self {
            relational,
            completions,
        }
    }

    fn validate(annotation: &Annotation) -> Result<(), ApiError> {
        if annotation.text.is_none() && annotation.metric.is_none() {
            return Err(ApiError::bad_request(
                "An annotation requires a text or a metric",
            ));
        }
        Ok(())
    }

    /// Store a batch. Annotations that bind a completion to an experiment
    /// also register the completion on the experiment.
    pub async fn create_annotations(
        &self,
        tenant_uid: i64,
        annotations: Vec<Annotation>,
    ) -> Result<Vec<Annotation>, ApiError> {
        for annotation in &annotations {
            Self::validate(annotation)?;
        }

        for annotation in &annotations {
            self.relational.store_annotation(tenant_uid, annotation).await?;
            // Mirror into analytics for SQL joins; best effort
            if let Err(e) = self.completions.store_annotation(tenant_uid, annotation).await {
                tracing::warn!("error mirroring annotation: {}", e.message);
            }

            let completion_id = annotation.target.as_ref().and_then(|t| t.completion_id);
            let experiment_id = annotation
                .context
                .as_ref()
                .and_then(|c| c.experiment_id.clone())
                .or_else(|| {
                    annotation
                        .target
                        .as_ref()
                        .and_then(|t| t.experiment_id.clone())
                });
            if let (Some(completion_id), Some(experiment_id)) = (completion_id, experiment_id) {
                if let Err(e) = self
                    .completions
                    .add_completion_to_experiment(tenant_uid, &experiment_id, completion_id)
                    .await
                {
                    tracing::warn!("error attaching completion to experiment: {}", e.message);
                }
            }
        }
        Ok(annotations)
    }

    pub async fn delete_annotation(
        &self,
        tenant_uid: i64,
        annotation_id: Uuid,
    ) -> Result<(), ApiError> {
        self.relational.delete_annotation(tenant_uid, annotation_id).await
    }

    pub async fn list_annotations(
        &self,
        tenant_uid: i64,
        filter: AnnotationFilter,
    ) -> Result<Vec<Annotation>, ApiError> {
        self.relational.list_annotations(tenant_uid, &filter).await
    }
}

/// Build a new annotation with server-assigned id and timestamps
pub fn new_annotation(mut annotation: Annotation) -> Annotation {
    annotation.id = crate::domain::hashing::uuid7();
    let now = Utc::now();
    annotation.created_at = now;
    annotation.updated_at = now;
    annotation.deleted_at = None;
    annotation
}
