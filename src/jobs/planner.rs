//! Expands a job's filter options into the ordered (channel, model) task list.
//!
//! Per channel, candidate models are chosen by, in order of precedence:
//! 1. selected mode with a non-empty target list: default model (when
//!    targeted) then the channel's models, restricted to the targets;
//! 2. scope `default`: the default test model, else the first listed model;
//! 3. scope `all`: every listed model, optionally with the default prepended.
//!
//! Whitelist then blacklist are applied afterwards. A channel that ends up
//! empty but has a default model falls back to it, except in selected mode.

use std::collections::HashSet;
use std::sync::Arc;

use crate::channel::Channel;
use crate::jobs::{JobError, ModelScope, TestJobOptions, TestMode, TestTask};
use crate::storage::ChannelStore;

/// Load the channels a job covers.
pub fn fetch_channels(
    store: &ChannelStore,
    options: &TestJobOptions,
) -> Result<Vec<Channel>, JobError> {
    let ids = if options.include_all {
        None
    } else {
        let mut seen = HashSet::new();
        let ids: Vec<i64> = options
            .channel_ids
            .iter()
            .copied()
            .filter(|id| *id > 0 && seen.insert(*id))
            .collect();
        if ids.is_empty() {
            return Err(JobError::NoChannelsSelected);
        }
        Some(ids)
    };

    let channels = store.query(ids.as_deref(), !options.include_disabled)?;
    if channels.is_empty() {
        return Err(JobError::NoChannelsFound);
    }
    Ok(channels)
}

/// Fetch and expand in one step. Fails when nothing would be tested.
pub fn plan_job(
    store: &ChannelStore,
    options: &TestJobOptions,
) -> Result<(Vec<Channel>, Vec<TestTask>), JobError> {
    let channels = fetch_channels(store, options)?;
    let tasks = plan_tasks(&channels, options);
    if tasks.is_empty() {
        return Err(JobError::NoTasksPlanned);
    }
    Ok((channels, tasks))
}

/// Cartesian expansion: channel order first, then each channel's model order.
pub fn plan_tasks(channels: &[Channel], options: &TestJobOptions) -> Vec<TestTask> {
    let mut tasks = Vec::new();
    for channel in channels {
        let models = pick_models_for_channel(channel, options);
        if models.is_empty() {
            continue;
        }
        let channel = Arc::new(channel.clone());
        tasks.extend(models.into_iter().map(|model| TestTask {
            channel: Arc::clone(&channel),
            model,
        }));
    }
    tasks
}

/// Deduplicated, order-preserving model selection for one channel.
pub fn pick_models_for_channel(channel: &Channel, options: &TestJobOptions) -> Vec<String> {
    let models = channel.model_list();
    let default_model = channel.default_test_model();

    let targets = normalized(&options.target_models);
    let selected_mode = options.test_mode == TestMode::Selected && !targets.is_empty();

    let mut picked = if selected_mode {
        let wanted: HashSet<&str> = targets.iter().map(String::as_str).collect();
        let head = default_model.filter(|m| wanted.contains(m));
        dedup(
            head.into_iter()
                .chain(models.iter().map(String::as_str))
                .filter(|m| wanted.contains(m)),
        )
    } else {
        match options.model_scope {
            ModelScope::Default => default_model
                .or_else(|| models.first().map(String::as_str))
                .map(|m| vec![m.to_string()])
                .unwrap_or_default(),
            ModelScope::All => {
                let mut all = dedup(models.iter().map(String::as_str));
                if options.use_channel_default {
                    if let Some(default) = default_model {
                        if !all.iter().any(|m| m == default) {
                            all.insert(0, default.to_string());
                        }
                    }
                }
                all
            }
        }
    };

    let whitelist = normalized(&options.model_whitelist);
    if !whitelist.is_empty() {
        let keep: HashSet<&str> = whitelist.iter().map(String::as_str).collect();
        picked = dedup(picked.iter().map(String::as_str).filter(|m| keep.contains(m)));
    }

    let blacklist = normalized(&options.model_blacklist);
    if !blacklist.is_empty() {
        let drop: HashSet<&str> = blacklist.iter().map(String::as_str).collect();
        picked = dedup(picked.iter().map(String::as_str).filter(|m| !drop.contains(m)));
    }

    if picked.is_empty() && !selected_mode {
        if let Some(default) = default_model {
            picked.push(default.to_string());
        }
    }

    picked
}

fn normalized(list: &[String]) -> Vec<String> {
    dedup(list.iter().map(|m| m.trim()).filter(|m| !m.is_empty()))
}

fn dedup<'a>(models: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    models
        .into_iter()
        .filter(|m| seen.insert(*m))
        .map(str::to_string)
        .collect()
}
