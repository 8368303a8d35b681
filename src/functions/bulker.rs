//! Warehouse loader destination
//!
//! Connections with `usesBulker` end in this function instead of a
//! destination-specific one. Events are posted one by one to the bulker
//! ingest endpoint; batching and loading happen on the bulker side.

use super::{ChainFunction, FuncContext, FuncReturn};
use crate::error::FuncError;
use crate::event::AnyEvent;
use crate::store::entities::Connection;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Layout used when the connection does not set one
pub const DEFAULT_DATA_LAYOUT: &str = "segment-single-table";

/// Bulker settings embedded into the function config at chain build time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkerConfig {
    /// Base URL of the bulker
    pub bulker_endpoint: String,
    /// Bearer token
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Bulker-side destination id
    pub destination_id: String,
    /// Connection the events belong to
    pub connection_id: String,
    /// How events map to tables
    pub data_layout: String,
    /// Loading mode (`stream` or `batch`)
    #[serde(default)]
    pub mode: Option<String>,
    /// Fixed table name, overriding the layout
    #[serde(default)]
    pub table_name: Option<String>,
}

impl BulkerConfig {
    /// Settings for one connection
    pub fn for_connection(
        connection: &Connection,
        endpoint: &str,
        auth_token: Option<&str>,
    ) -> Self {
        Self {
            bulker_endpoint: endpoint.trim_end_matches('/').to_string(),
            auth_token: auth_token.map(str::to_string),
            destination_id: connection.id.clone(),
            connection_id: connection.id.clone(),
            data_layout: connection
                .options
                .data_layout
                .clone()
                .unwrap_or_else(|| DEFAULT_DATA_LAYOUT.to_string()),
            mode: connection.options.mode.clone(),
            table_name: connection.options.table_name.clone(),
        }
    }

    /// Table an event lands in
    pub fn table_for(&self, event: &AnyEvent) -> String {
        if let Some(table) = &self.table_name {
            return table.clone();
        }
        if self.data_layout != "segment" {
            return "events".to_string();
        }
        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "track" => event
                .get("event")
                .and_then(Value::as_str)
                .map(to_snake_case)
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "tracks".to_string()),
            "identify" => "identifies".to_string(),
            "page" => "pages".to_string(),
            "screen" => "screens".to_string(),
            "group" => "groups".to_string(),
            "alias" => "aliases".to_string(),
            _ => "events".to_string(),
        }
    }

    /// Ingest URL for one event
    pub fn url_for(&self, event: &AnyEvent) -> String {
        let mut url = format!(
            "{}/post/{}?tableName={}",
            self.bulker_endpoint,
            self.destination_id,
            self.table_for(event)
        );
        if let Some(mode) = &self.mode {
            url.push_str("&mode=");
            url.push_str(mode);
        }
        url
    }
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && !last_underscore {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Function posting events to the bulker
#[derive(Debug, Default)]
pub struct BulkerDestination;

#[async_trait]
impl ChainFunction for BulkerDestination {
    async fn exec(&self, event: AnyEvent, ctx: &FuncContext) -> Result<FuncReturn, FuncError> {
        let config: BulkerConfig = serde_json::from_value(ctx.props.clone())
            .map_err(|e| FuncError::error(format!("invalid bulker configuration: {e}")))?;
        let mut headers = HashMap::new();
        if let Some(token) = &config.auth_token {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        ctx.fetch
            .send_json(Method::POST, &config.url_for(&event), &headers, &event)
            .await?;
        Ok(FuncReturn::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config(layout: &str) -> BulkerConfig {
        BulkerConfig {
            bulker_endpoint: "http://bulker:3042".into(),
            auth_token: Some("secret".into()),
            destination_id: "conn-1".into(),
            connection_id: "conn-1".into(),
            data_layout: layout.into(),
            mode: Some("stream".into()),
            table_name: None,
        }
    }

    #[test]
    fn test_segment_layout_tables() {
        let cfg = config("segment");
        assert_eq!(
            cfg.table_for(&json!({"type": "track", "event": "Order Completed"})),
            "order_completed"
        );
        assert_eq!(cfg.table_for(&json!({"type": "track"})), "tracks");
        assert_eq!(cfg.table_for(&json!({"type": "identify"})), "identifies");
        assert_eq!(cfg.table_for(&json!({"type": "other"})), "events");
    }

    #[test]
    fn test_single_table_and_override() {
        let mut cfg = config(DEFAULT_DATA_LAYOUT);
        assert_eq!(cfg.table_for(&json!({"type": "page"})), "events");
        cfg.table_name = Some("custom".into());
        assert_eq!(cfg.table_for(&json!({"type": "page"})), "custom");
    }

    #[test]
    fn test_url() {
        let cfg = config("segment");
        assert_eq!(
            cfg.url_for(&json!({"type": "page"})),
            "http://bulker:3042/post/conn-1?tableName=pages&mode=stream"
        );
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(to_snake_case("buttonClicked"), "button_clicked");
        assert_eq!(to_snake_case("  Sign-Up  "), "sign_up");
    }
}
