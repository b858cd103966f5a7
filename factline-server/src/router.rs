use factline_core::ipc::{FactlineRequest, FactlineResponse};
use factline_core::{Result, TemporalMemory};
use serde::Serialize;

/// Dispatch one IPC request. Shared by the Unix socket server and every
/// HTTP handler, so both surfaces report identical data and error kinds.
pub async fn handle_request(request: FactlineRequest, memory: &TemporalMemory) -> FactlineResponse {
    match request {
        FactlineRequest::Ping => FactlineResponse::pong(),
        FactlineRequest::Health => match memory.health().await {
            Ok(backend) => FactlineResponse::ok(serde_json::json!({
                "status": "healthy",
                "backend": backend,
            })),
            Err(e) => FactlineResponse::from_error(&e),
        },
        FactlineRequest::Append { fact } => respond(memory.append(fact).await),
        FactlineRequest::Supersede { old_fact_id, fact } => {
            respond(memory.supersede(old_fact_id, fact).await)
        }
        FactlineRequest::GetFact { id } => respond(memory.facts().get(id).await),
        FactlineRequest::Resolve { name, kind } => {
            respond(memory.resolver().resolve_detailed(&name, kind).await)
        }
        FactlineRequest::Merge { keep_id, merge_id } => {
            respond(memory.resolver().merge(keep_id, merge_id).await)
        }
        FactlineRequest::GetEntity { id } => respond(memory.resolver().entity(id).await),
        FactlineRequest::FactsForEntity { entity_id, as_of } => {
            respond(memory.facts().facts_for_entity(entity_id, as_of).await)
        }
        FactlineRequest::Current { entity_id } => {
            respond(memory.query().current_facts(entity_id).await)
        }
        FactlineRequest::History { entity_id } => respond(memory.query().history(entity_id).await),
        FactlineRequest::AsOf { entity_id, at } => respond(memory.query().as_of(entity_id, at).await),
        FactlineRequest::Changes { entity_id, from, to } => {
            respond(memory.query().changes(entity_id, from, to).await)
        }
        FactlineRequest::BeginEpisode {
            source,
            occurred_at,
            recorded_by,
        } => {
            let occurred_at = occurred_at.unwrap_or_else(|| memory.clock().now());
            let result = async {
                let id = memory
                    .episodes()
                    .begin_episode(&source, occurred_at, recorded_by)
                    .await?;
                memory.episodes().episode(id).await
            }
            .await;
            respond(result)
        }
        FactlineRequest::RecordFact { episode_id, fact } => {
            respond(memory.episodes().record_fact(episode_id, fact).await)
        }
        FactlineRequest::RecordSuperseding {
            episode_id,
            old_fact_id,
            fact,
        } => respond(
            memory
                .episodes()
                .record_superseding(episode_id, old_fact_id, fact)
                .await,
        ),
        FactlineRequest::CloseEpisode { episode_id } => {
            respond(memory.episodes().close_episode(episode_id).await)
        }
        FactlineRequest::GetEpisode { episode_id } => {
            respond(memory.episodes().episode(episode_id).await)
        }
        FactlineRequest::RetractEpisode { episode_id } => {
            respond(
                memory
                    .episodes()
                    .retract_episode(episode_id)
                    .await
                    .map(|fact_ids| serde_json::json!({ "episode_id": episode_id, "retracted": fact_ids })),
            )
        }
    }
}

fn respond<T: Serialize>(result: Result<T>) -> FactlineResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => FactlineResponse::ok(data),
            Err(e) => FactlineResponse::err(format!("Serialization error: {}", e)),
        },
        Err(e) => {
            tracing::debug!(kind = e.kind(), error = %e, "request failed");
            FactlineResponse::from_error(&e)
        }
    }
}
