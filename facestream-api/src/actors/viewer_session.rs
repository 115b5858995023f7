/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! One actor per viewer WebSocket connection.
//!
//! The actor speaks the JSON envelope protocol, binds the connection to a
//! broker session on `subscribe` and acts as the [`FrameSink`] the broker
//! pushes frames through.

use std::sync::Arc;

use actix::clock::Instant;
use actix::{
    Actor, ActorContext, ActorFutureExt, Addr, AsyncContext, ContextFutureSpawner, Handler,
    Message as ActixMessage, Running, StreamHandler, WrapFuture,
};
use actix_web_actors::ws::{self, WebsocketContext};
use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use facestream_types::{ClientEnvelope, ServerEnvelope};

use crate::broker::subscribers::{FrameSink, SinkClosed};
use crate::broker::StreamBroker;
use crate::constants::{CLIENT_TIMEOUT, HEARTBEAT_INTERVAL};

/// Pre-serialised envelope on its way out to the peer.
#[derive(ActixMessage)]
#[rtype(result = "()")]
pub struct Outbound(pub Arc<String>);

/// The bound session is gone; close the connection.
#[derive(ActixMessage)]
#[rtype(result = "()")]
pub struct Hangup;

pub struct WsViewerSession {
    pub id: String,
    pub broker: Arc<StreamBroker>,
    heartbeat: Instant,
    bound_session: Option<String>,
}

impl WsViewerSession {
    pub fn new(broker: Arc<StreamBroker>) -> Self {
        let id = Uuid::new_v4().to_string();
        info!("new viewer connection {id}");
        Self {
            id,
            broker,
            heartbeat: Instant::now(),
            bound_session: None,
        }
    }

    fn heartbeat(&self, ctx: &mut WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > CLIENT_TIMEOUT {
                warn!("viewer {} heartbeat timed out, disconnecting", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_envelope(&mut self, text: &str, ctx: &mut WebsocketContext<Self>) {
        match ClientEnvelope::from_json(text) {
            Ok(ClientEnvelope::Subscribe { session_id }) => {
                let broker = Arc::clone(&self.broker);
                let client_id = self.id.clone();
                let sink: Arc<dyn FrameSink> = Arc::new(WsSink {
                    addr: ctx.address(),
                });
                async move {
                    broker
                        .subscribe(&client_id, sink, &session_id)
                        .await
                        .map(|_| session_id)
                }
                .into_actor(self)
                .map(|result, act, ctx| match result {
                    Ok(session_id) => {
                        act.bound_session = Some(session_id.clone());
                        ctx.text(
                            ServerEnvelope::Subscribed {
                                session_id,
                                message: "subscribed".to_string(),
                            }
                            .to_json(),
                        );
                    }
                    Err(e) => {
                        ctx.text(
                            ServerEnvelope::Error {
                                message: e.user_message(),
                            }
                            .to_json(),
                        );
                    }
                })
                .spawn(ctx);
            }
            Ok(ClientEnvelope::Unsubscribe) => {
                self.bound_session = None;
                let broker = Arc::clone(&self.broker);
                let client_id = self.id.clone();
                async move {
                    broker.unsubscribe(&client_id).await;
                }
                .into_actor(self)
                .spawn(ctx);
            }
            Err(e) => {
                debug!("viewer {}: unparseable envelope: {e}", self.id);
                ctx.text(
                    ServerEnvelope::Error {
                        message: "unrecognized message".to_string(),
                    }
                    .to_json(),
                );
            }
        }
    }
}

impl Actor for WsViewerSession {
    type Context = WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        info!("viewer connection {} closing", self.id);
        let broker = Arc::clone(&self.broker);
        let client_id = self.id.clone();
        tokio::spawn(async move {
            broker.unsubscribe(&client_id).await;
        });
        Running::Stop
    }
}

impl Handler<Outbound> for WsViewerSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0.as_ref().clone());
    }
}

impl Handler<Hangup> for WsViewerSession {
    type Result = ();

    fn handle(&mut self, _msg: Hangup, ctx: &mut Self::Context) -> Self::Result {
        self.bound_session = None;
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some("stream ended".to_string()),
        }));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsViewerSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match item {
            Ok(msg) => msg,
            Err(err) => {
                warn!("viewer {}: protocol error: {err:?}", self.id);
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Text(text) => self.handle_envelope(&text, ctx),
            ws::Message::Ping(msg) => {
                self.heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            ws::Message::Pong(_) => {
                self.heartbeat = Instant::now();
            }
            ws::Message::Close(reason) => {
                debug!("viewer {} sent close", self.id);
                ctx.close(reason);
                ctx.stop();
            }
            _ => (),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop()
    }
}

/// Bridges the broker's pump task into the actor mailbox. `deliver` resolves
/// once the actor has written the text into its context, which is the
/// backpressure point that bounds frames in flight per client.
struct WsSink {
    addr: Addr<WsViewerSession>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn deliver(&self, text: Arc<String>) -> Result<(), SinkClosed> {
        self.addr.send(Outbound(text)).await.map_err(|_| SinkClosed)
    }

    async fn hangup(&self) {
        let _ = self.addr.send(Hangup).await;
    }
}
