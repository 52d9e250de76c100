//! Request dispatch: one handler per request event, one `<event>:result`
//! reply per request.

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use {
    futures::{FutureExt, future::BoxFuture},
    llamadash_protocol::{
        Envelope, Frame, RequestId, extract_request_id,
        methods::{self, Method},
        result_event,
    },
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::{
    error::{MethodError, MethodResult},
    state::GatewayState,
};

/// What a handler sees of the request.
pub struct MethodContext {
    pub state: Arc<GatewayState>,
    pub conn_id: String,
    pub params: Value,
}

type HandlerFn = Arc<dyn Fn(MethodContext) -> BoxFuture<'static, MethodResult<Value>> + Send + Sync>;

/// Request handlers keyed by event name.
pub struct MethodRegistry {
    handlers: HashMap<&'static str, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn decode<P: serde::de::DeserializeOwned>(params: Value) -> MethodResult<P> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| MethodError::InvalidParams(e.to_string()))
}

fn encode<T: serde::Serialize>(output: &T) -> MethodResult<Value> {
    serde_json::to_value(output).map_err(|e| MethodError::Internal(e.to_string()))
}

impl MethodRegistry {
    /// A registry with every dashboard request event wired to the services.
    pub fn new() -> Self {
        let mut reg = Self::empty();
        reg.register_models();
        reg.register_logs();
        reg.register_presets();
        reg.register_router();
        reg
    }

    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a raw handler under `event`, replacing any previous one.
    pub fn register_raw<F, Fut>(&mut self, event: &'static str, handler: F)
    where
        F: Fn(MethodContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult<Value>> + Send + 'static,
    {
        self.handlers
            .insert(event, Arc::new(move |ctx| handler(ctx).boxed()));
    }

    /// Register a typed handler: params are decoded before the call and the
    /// output encoded after it.
    pub fn register<M, F, Fut>(&mut self, handler: F)
    where
        M: Method,
        F: Fn(Arc<GatewayState>, M::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult<M::Output>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_raw(M::EVENT, move |ctx: MethodContext| {
            let handler = Arc::clone(&handler);
            async move {
                let params = decode::<M::Params>(ctx.params)?;
                let output = handler(ctx.state, params).await?;
                encode(&output)
            }
        });
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `frame` and build its single result frame.
    ///
    /// Unknown events, handler errors and handler panics all become error
    /// envelopes. A request without a `requestId` is answered under a
    /// fabricated one.
    pub async fn dispatch(
        &self,
        state: Arc<GatewayState>,
        conn_id: &str,
        frame: Frame,
    ) -> Frame {
        let event = frame.event;
        let request_id = extract_request_id(&frame.data).unwrap_or_else(RequestId::fallback);

        let outcome = match self.handlers.get(event.as_str()) {
            None => Err(MethodError::NotFound(format!("Unknown event: {event}"))),
            Some(handler) => {
                let ctx = MethodContext {
                    state,
                    conn_id: conn_id.to_string(),
                    params: frame.data,
                };
                match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(event = %event, conn_id, "handler panicked");
                        Err(MethodError::Internal(format!("{event} failed")))
                    },
                }
            },
        };

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "llamadash_gateway_requests_total",
            "event" => event.clone(),
            "outcome" => match &outcome {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            }
        )
        .increment(1);

        let envelope = match outcome {
            Ok(data) => {
                debug!(event = %event, conn_id, request_id = %request_id.key(), "request ok");
                Envelope::ok(request_id, data)
            },
            Err(e) => {
                debug!(event = %event, conn_id, kind = e.kind(), error = %e, "request failed");
                Envelope::err(request_id, e.to_string())
            },
        };

        let data = envelope.to_value().unwrap_or_else(|e| {
            warn!(event = %event, error = %e, "failed to encode result envelope");
            Value::Null
        });
        Frame::new(result_event(&event), data)
    }

    // ── Models ───────────────────────────────────────────────────────────

    fn register_models(&mut self) {
        self.register::<methods::ModelsList, _, _>(|state, _| async move {
            Ok(methods::ModelList {
                models: state.services.models.list(),
            })
        });
        self.register::<methods::ModelsGet, _, _>(|state, params| async move {
            let model = state.services.models.get(&params.model_id)?;
            Ok(methods::ModelEnvelope { model })
        });
        self.register::<methods::ModelsCreate, _, _>(|state, params| async move {
            let model = state.services.models.create(params.model)?;
            Ok(methods::ModelEnvelope { model })
        });
        self.register::<methods::ModelsUpdate, _, _>(|state, params| async move {
            let model = state
                .services
                .models
                .update(&params.model_id, &params.updates)?;
            Ok(methods::ModelEnvelope { model })
        });
        self.register::<methods::ModelsDelete, _, _>(|state, params| async move {
            let deleted_id = state.services.models.delete(&params.model_id)?;
            Ok(methods::ModelDeleted { deleted_id })
        });
        self.register::<methods::ModelsLoad, _, _>(|state, params| async move {
            state.services.router.load(&params.model_name).await
        });
        self.register::<methods::ModelsUnload, _, _>(|state, params| async move {
            state.services.router.unload(&params.model_name).await
        });
        self.register::<methods::ModelsScan, _, _>(|state, _| async move {
            Ok(state.services.models.scan())
        });
    }

    // ── Logs ─────────────────────────────────────────────────────────────

    fn register_logs(&mut self) {
        self.register::<methods::LogsGet, _, _>(|state, params| async move {
            Ok(methods::LogList {
                logs: state.services.logs.recent(params.limit),
            })
        });
        self.register::<methods::LogsClear, _, _>(|state, _| async move {
            Ok(methods::LogsCleared {
                cleared: state.services.logs.clear(),
            })
        });
    }

    // ── Presets ──────────────────────────────────────────────────────────

    fn register_presets(&mut self) {
        self.register::<methods::PresetsList, _, _>(|state, _| async move {
            Ok(methods::PresetList {
                presets: state.services.presets.list(),
            })
        });
        self.register::<methods::PresetsRead, _, _>(|state, params| async move {
            let preset = state.services.presets.read(&params.filename)?;
            Ok(methods::PresetEnvelope { preset })
        });
        self.register::<methods::PresetsSave, _, _>(|state, params| async move {
            state.services.presets.save(&params.filename, &params.config)
        });
        self.register::<methods::PresetsCreate, _, _>(|state, params| async move {
            state
                .services
                .presets
                .create(&params.filename, params.description.as_deref())
        });
        self.register::<methods::PresetsDelete, _, _>(|state, params| async move {
            state.services.presets.delete(&params.filename)
        });
    }

    // ── Router ───────────────────────────────────────────────────────────

    fn register_router(&mut self) {
        self.register::<methods::LlamaStatus, _, _>(|state, _| async move {
            Ok(methods::StatusEnvelope {
                status: state.services.router.status().await,
            })
        });
        self.register::<methods::LlamaStart, _, _>(|state, _| async move {
            state.services.router.start().await
        });
        self.register::<methods::LlamaStop, _, _>(|state, _| async move {
            state.services.router.stop().await
        });
        self.register::<methods::LlamaRestart, _, _>(|state, _| async move {
            state.services.router.restart().await
        });
        self.register::<methods::LlamaConfig, _, _>(|state, params| async move {
            let settings = state.services.router.configure(params.settings).await?;
            Ok(methods::RouterConfig { settings })
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::{broadcast::EventBus, services::GatewayServices},
        llamadash_config::ServerConfig,
        llamadash_protocol::events,
        serde_json::json,
    };

    fn state() -> Arc<GatewayState> {
        let bus = EventBus::new();
        GatewayState::new(
            ServerConfig::default(),
            GatewayServices::local(&bus, 100),
            bus,
        )
    }

    async fn call(reg: &MethodRegistry, event: &str, data: Value) -> Envelope {
        let reply = reg
            .dispatch(state(), "conn-1", Frame::new(event, data))
            .await;
        assert_eq!(reply.event, result_event(event));
        Envelope::from_value(reply.data).unwrap()
    }

    #[test]
    fn every_request_event_is_registered() {
        let names = MethodRegistry::new().method_names();
        for event in [
            events::MODELS_LIST,
            events::MODELS_GET,
            events::MODELS_CREATE,
            events::MODELS_UPDATE,
            events::MODELS_DELETE,
            events::MODELS_LOAD,
            events::MODELS_UNLOAD,
            events::MODELS_SCAN,
            events::LOGS_GET,
            events::LOGS_CLEAR,
            events::PRESETS_LIST,
            events::PRESETS_READ,
            events::PRESETS_SAVE,
            events::PRESETS_CREATE,
            events::PRESETS_DELETE,
            events::LLAMA_STATUS,
            events::LLAMA_START,
            events::LLAMA_STOP,
            events::LLAMA_RESTART,
            events::LLAMA_CONFIG,
        ] {
            assert!(names.contains(&event), "{event} missing");
        }
    }

    #[tokio::test]
    async fn unknown_event_gets_error_envelope() {
        let env = call(&MethodRegistry::new(), "models:explode", json!({"requestId": 4})).await;
        assert_eq!(env.request_id, RequestId::Number(4));
        assert_eq!(env.outcome.unwrap_err().message, "Unknown event: models:explode");
    }

    #[tokio::test]
    async fn missing_request_id_is_fabricated() {
        let env = call(&MethodRegistry::new(), events::MODELS_LIST, Value::Null).await;
        assert!(matches!(env.request_id, RequestId::Number(n) if n > 0));
        assert_eq!(env.outcome.unwrap()["models"], json!([]));
    }

    #[tokio::test]
    async fn handler_errors_become_messages() {
        let env = call(
            &MethodRegistry::new(),
            events::MODELS_GET,
            json!({"modelId": "ghost", "requestId": "r1"}),
        )
        .await;
        assert_eq!(env.outcome.unwrap_err().message, "Model not found: ghost");
    }

    #[tokio::test]
    async fn bad_params_are_rejected() {
        let env = call(
            &MethodRegistry::new(),
            events::MODELS_GET,
            json!({"requestId": 1}),
        )
        .await;
        assert!(env.outcome.unwrap_err().message.starts_with("invalid params"));
    }

    #[tokio::test]
    async fn panicking_handler_still_replies() {
        let mut reg = MethodRegistry::empty();
        reg.register_raw("boom", |ctx| async move {
            if ctx.params.is_object() {
                panic!("handler bug");
            }
            Ok(Value::Null)
        });
        let env = call(&reg, "boom", json!({"requestId": 9})).await;
        assert!(!env.is_success());
        assert_eq!(env.request_id, RequestId::Number(9));
    }
}
