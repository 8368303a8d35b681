//! Functions shipped with rotor

use super::{ChainFunction, FuncContext, FuncReturn};
use crate::error::FuncError;
use crate::event::{context_get, context_mut, AnyEvent};
use crate::events_log::LogLevel;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;

/// Drops events whose normalized user agent is flagged as a bot
#[derive(Debug, Default)]
pub struct BotFilter;

#[async_trait]
impl ChainFunction for BotFilter {
    async fn exec(&self, event: AnyEvent, _ctx: &FuncContext) -> Result<FuncReturn, FuncError> {
        let is_bot = context_get(&event, "ua")
            .and_then(|ua| ua.get("bot"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(if is_bot {
            FuncReturn::Drop
        } else {
            FuncReturn::Unchanged
        })
    }
}

/// Zeroes the host part of `context.ip` (last octet for IPv4, last 80 bits
/// for IPv6)
#[derive(Debug, Default)]
pub struct IpAnonymization;

impl IpAnonymization {
    fn anonymize(ip: &str) -> Option<String> {
        match ip.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => {
                let [a, b, c, _] = v4.octets();
                Some(format!("{a}.{b}.{c}.0"))
            }
            IpAddr::V6(v6) => {
                let mut segments = v6.segments();
                for segment in segments.iter_mut().skip(3) {
                    *segment = 0;
                }
                Some(std::net::Ipv6Addr::from(segments).to_string())
            }
        }
    }
}

#[async_trait]
impl ChainFunction for IpAnonymization {
    async fn exec(&self, mut event: AnyEvent, _ctx: &FuncContext) -> Result<FuncReturn, FuncError> {
        let Some(ctx) = context_mut(&mut event) else {
            return Ok(FuncReturn::Unchanged);
        };
        let Some(masked) = ctx.get("ip").and_then(Value::as_str).and_then(Self::anonymize) else {
            return Ok(FuncReturn::Unchanged);
        };
        ctx.insert("ip".into(), Value::String(masked));
        Ok(FuncReturn::One(event))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookConfig {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Posts every event as JSON to the configured URL
#[derive(Debug, Default)]
pub struct WebhookDestination;

#[async_trait]
impl ChainFunction for WebhookDestination {
    async fn exec(&self, event: AnyEvent, ctx: &FuncContext) -> Result<FuncReturn, FuncError> {
        let config: WebhookConfig = serde_json::from_value(ctx.props.clone())
            .map_err(|e| FuncError::error(format!("invalid webhook configuration: {e}")))?;
        let method = match config.method.as_deref() {
            None => Method::POST,
            Some(m) => m
                .to_ascii_uppercase()
                .parse::<Method>()
                .map_err(|e| FuncError::error(format!("invalid webhook method '{m}': {e}")))?,
        };

        ctx.fetch
            .send_json(method, &config.url, &config.headers, &event)
            .await?;
        ctx.logger.log(
            &ctx.event.connection_id,
            LogLevel::Debug,
            json!({"type": "webhook", "url": config.url, "messageId": ctx.event.message_id}),
        );
        Ok(FuncReturn::Unchanged)
    }
}

/// Accepts and discards everything
#[derive(Debug, Default)]
pub struct DevNullDestination;

#[async_trait]
impl ChainFunction for DevNullDestination {
    async fn exec(&self, _event: AnyEvent, _ctx: &FuncContext) -> Result<FuncReturn, FuncError> {
        Ok(FuncReturn::Unchanged)
    }
}
