//! Liveness check route.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use game_runtime::{HandlerContext, Map, ParamError, ResponseCode, Route, Value};

#[derive(Debug, Default)]
pub struct Ping;

#[async_trait]
impl Route for Ping {
    fn parse(&mut self, _params: &Map<String, Value>) -> Result<(), ParamError> {
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut HandlerContext) -> ResponseCode {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        ctx.insert("pong", true);
        ctx.insert("server_time", now);
        ResponseCode::SUCCESS
    }
}
