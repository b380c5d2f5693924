use crate::channel::{Channel, ChannelStatus, NewChannel};
use crate::storage::Pool;
use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Row};

const CHANNEL_COLUMNS: &str =
    "id, name, channel_type, status, base_url, api_key, models, test_model";

/// Channel rows.
#[derive(Clone)]
pub struct ChannelStore {
    pool: Pool,
}

impl ChannelStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn insert(&self, channel: &NewChannel) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO channels (name, channel_type, status, base_url, api_key, models, test_model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                channel.name,
                channel.channel_type.as_str(),
                channel.status.code(),
                channel.base_url,
                channel.key,
                channel.models,
                channel.test_model,
            ],
        )
        .context("Failed to insert channel")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<Channel>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map([id], map_channel)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list(&self) -> Result<Vec<Channel>> {
        self.query(None, false)
    }

    /// Channels filtered by id set and/or enabled status, ordered by id.
    ///
    /// `Some(&[])` matches nothing.
    pub fn query(&self, ids: Option<&[i64]>, enabled_only: bool) -> Result<Vec<Channel>> {
        if matches!(ids, Some(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }

        let mut clauses = Vec::new();
        let mut args: Vec<i64> = Vec::new();
        if let Some(ids) = ids {
            let placeholders = (1..=ids.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            clauses.push(format!("id IN ({})", placeholders));
            args.extend_from_slice(ids);
        }
        if enabled_only {
            args.push(ChannelStatus::Enabled.code());
            clauses.push(format!("status = ?{}", args.len()));
        }

        let mut sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id ASC");

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), map_channel)?;

        let mut channels = Vec::new();
        for r in rows {
            channels.push(r?);
        }
        Ok(channels)
    }

    pub fn set_status(&self, id: i64, status: ChannelStatus) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE channels SET status = ?2 WHERE id = ?1",
            params![id, status.code()],
        )?;
        if changed == 0 {
            anyhow::bail!("Channel {} not found", id);
        }
        Ok(())
    }
}

fn map_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let type_str: String = row.get(2)?;
    let channel_type = type_str.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })?;

    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        channel_type,
        status: ChannelStatus::from_code(row.get(3)?),
        base_url: row.get(4)?,
        key: row.get(5)?,
        models: row.get(6)?,
        test_model: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;
    use crate::storage::testing::scratch_pool;

    fn new_channel(name: &str, status: ChannelStatus) -> NewChannel {
        NewChannel {
            name: name.to_string(),
            channel_type: ChannelType::OpenAi,
            status,
            base_url: "https://api.example.com".to_string(),
            key: "sk-test".to_string(),
            models: "gpt-4o,gpt-4o-mini".to_string(),
            test_model: Some("gpt-4o-mini".to_string()),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, pool) = scratch_pool();
        let store = ChannelStore::new(pool);

        let id = store.insert(&new_channel("a", ChannelStatus::Enabled)).unwrap();
        let ch = store.get(id).unwrap().unwrap();
        assert_eq!(ch.name, "a");
        assert_eq!(ch.channel_type, ChannelType::OpenAi);
        assert_eq!(ch.model_list(), vec!["gpt-4o", "gpt-4o-mini"]);
        assert_eq!(ch.default_test_model(), Some("gpt-4o-mini"));
        assert!(store.get(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_query_filters() {
        let (_dir, pool) = scratch_pool();
        let store = ChannelStore::new(pool);

        let a = store.insert(&new_channel("a", ChannelStatus::Enabled)).unwrap();
        let b = store.insert(&new_channel("b", ChannelStatus::ManuallyDisabled)).unwrap();
        let c = store.insert(&new_channel("c", ChannelStatus::Enabled)).unwrap();

        let all = store.query(None, false).unwrap();
        assert_eq!(all.len(), 3);

        let enabled: Vec<i64> = store.query(None, true).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(enabled, vec![a, c]);

        let picked: Vec<i64> = store
            .query(Some(&[c, b]), false)
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(picked, vec![b, c]);

        let picked_enabled: Vec<i64> = store
            .query(Some(&[b, c]), true)
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(picked_enabled, vec![c]);

        assert!(store.query(Some(&[]), false).unwrap().is_empty());
    }

    #[test]
    fn test_set_status() {
        let (_dir, pool) = scratch_pool();
        let store = ChannelStore::new(pool);
        let id = store.insert(&new_channel("a", ChannelStatus::Enabled)).unwrap();

        store.set_status(id, ChannelStatus::AutoDisabled).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().status, ChannelStatus::AutoDisabled);
        assert!(store.set_status(id + 1, ChannelStatus::Enabled).is_err());
    }
}
