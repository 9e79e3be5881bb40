//! Concurrent export of all entities.
//!
//! Each entity is exported by its own task. Tasks own their counts and hand
//! them back; only the caller sums them.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::domain::error::FILE_ACCESS_HELP;
use crate::domain::{
    AppError, AttachmentMap, ContactDirectory, Counts, EntityChats, ExportConfig, HandleMap,
    Result,
};
use crate::infrastructure::opsys::{file_access, join_under};

use super::context::ExportContext;
use super::writer::FileWriter;

/// Export every selected entity, returning the summed counts.
///
/// # Errors
/// Returns the first error of any entity, or of the lookups before them.
pub async fn export_chats(
    ctx: Arc<ExportContext>,
    contacts: Option<Arc<ContactDirectory>>,
) -> Result<Counts> {
    let mut total = Counts::default();
    export_chats_into(ctx, contacts, &mut total).await?;
    Ok(total)
}

/// Export every selected entity, adding the counts of each finished entity
/// to `total` as it completes.
///
/// The first failing entity ends the export, leaving `total` with the
/// entities finished before it. Entities not yet started are abandoned; ones
/// already writing run to completion in the background and their results
/// are dropped.
///
/// # Errors
/// Returns the first error of any entity, or of the lookups before them.
pub async fn export_chats_into(
    ctx: Arc<ExportContext>,
    contacts: Option<Arc<ContactDirectory>>,
    total: &mut Counts,
) -> Result<()> {
    let source = Arc::clone(&ctx.source);
    let attachments = blocking(move || source.attachment_paths())
        .await
        .map_err(|e| e.context("get attachment paths"))?;
    if ctx.config.uses_attachments() {
        probe_attachment_access(&ctx.config, &attachments)?;
    }

    let source = Arc::clone(&ctx.source);
    let (handles, entities) = blocking(move || {
        let contacts = contacts.as_deref();
        let handles = source
            .handle_map(contacts)
            .map_err(|e| e.context("get handle map"))?;
        let entities = source.chats(contacts).map_err(|e| e.context("get chats"))?;
        Ok((handles, entities))
    })
    .await?;
    let entities = filter_entities(&ctx.config.entities, entities);
    tracing::info!("Exporting {} entities", entities.len());

    let attachments = Arc::new(attachments);
    let handles = Arc::new(handles);
    let permits = match ctx.config.max_concurrent_entities {
        0 => None,
        n => Some(Arc::new(Semaphore::new(n))),
    };

    let mut tasks = JoinSet::new();
    for entity in entities {
        let ctx = Arc::clone(&ctx);
        let handles = Arc::clone(&handles);
        let attachments = Arc::clone(&attachments);
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = match permits {
                Some(permits) => Some(permits.acquire_owned().await.map_err(|e| {
                    AppError::Task {
                        message: e.to_string(),
                    }
                })?),
                None => None,
            };
            blocking(move || export_entity_chats(&ctx, &handles, &attachments, &entity)).await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let counts = joined.map_err(|e| AppError::Task {
            message: e.to_string(),
        })??;
        total.merge(counts);
    }
    Ok(())
}

/// Export all chats of one entity, into one file or one file per chat.
///
/// # Errors
/// Returns error if message IDs cannot be read or a file cannot be written.
pub fn export_entity_chats(
    ctx: &ExportContext,
    handles: &HandleMap,
    attachments: &AttachmentMap,
    entity: &EntityChats,
) -> Result<Counts> {
    let mut counts = Counts::default();
    let merge = !ctx.config.separate_chats;
    let mut guids = Vec::new();
    let mut entity_ids = Vec::new();
    let mut writer = FileWriter::new(ctx, handles, attachments, &mut counts);

    for chat in &entity.chats {
        let ids = ctx
            .source
            .message_ids(chat.id)
            .map_err(|e| e.context(format!("get message IDs for chat ID {}", chat.id)))?;
        if merge {
            guids.push(chat.guid.clone());
            entity_ids.extend(ids);
        } else {
            writer.write_file(&entity.name, std::slice::from_ref(&chat.guid), ids)?;
        }
        writer.count_chat();
    }
    if merge {
        writer.write_file(&entity.name, &guids, entity_ids)?;
    }

    tracing::debug!(entity = %entity.name, chats = entity.chats.len(), "Exported entity");
    Ok(counts)
}

/// Fail early when the process may not read attachments at all, rather than
/// once per attachment.
fn probe_attachment_access(config: &ExportConfig, attachments: &AttachmentMap) -> Result<()> {
    let Some(first) = attachments
        .values()
        .filter_map(|atts| atts.first())
        .find(|att| !att.filename.is_empty())
    else {
        return Ok(());
    };
    let path = join_under(&config.attachments_path, Path::new(&first.filename));
    match file_access(&path) {
        // A missing file says nothing about permissions; it is reported
        // with its chat file.
        Err(AppError::Io {
            source: Some(ref e),
            ..
        }) if e.kind() == ErrorKind::NotFound => Ok(()),
        result => result
            .map_err(|e| e.context(format!("access to attachments - FIX: {FILE_ACCESS_HELP}"))),
    }
}

/// Keep only the named entities. No names means all entities.
fn filter_entities(names: &[String], entities: Vec<EntityChats>) -> Vec<EntityChats> {
    if names.is_empty() {
        return entities;
    }
    entities
        .into_iter()
        .filter(|e| names.contains(&e.name))
        .collect()
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Task {
            message: e.to_string(),
        })?
}
