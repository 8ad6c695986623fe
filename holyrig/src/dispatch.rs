//! # Dispatcher
//!
//! Routes parsed RPC requests to rig runtimes. All JSON-to-typed coercion
//! happens here, once, at the boundary: past this point the engine only
//! sees concrete [`Value`]s. Capability queries reflect the *supported*
//! subset of each rig's model; a command the model does not implement never
//! appears in a response.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use holyrig_types::{Parameter, Type, Value};
use serde::Deserialize;
use serde_json::{json, Map, Value as Json};
use tokio::sync::{mpsc, oneshot};

use crate::rig::RigHandle;
use crate::rpc::{codes, RpcFailure};
use crate::subscribe::SubscribeRequest;

/// The RPC-facing router.
#[derive(Debug)]
pub struct Dispatcher {
    rigs: BTreeMap<String, RigHandle>,
    /// Rigs whose schema or model failed to compile; configured but dead.
    disabled: BTreeSet<String>,
    subscriptions: mpsc::Sender<SubscribeRequest>,
}

#[derive(Debug, Deserialize)]
struct RigParams {
    rig_id: String,
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    rig_id: String,
    command: String,
    #[serde(default)]
    parameters: BTreeMap<String, Json>,
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    rig_id: String,
    fields: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeParams {
    subscription_id: String,
}

impl Dispatcher {
    pub fn new(
        rigs: BTreeMap<String, RigHandle>,
        disabled: BTreeSet<String>,
        subscriptions: mpsc::Sender<SubscribeRequest>,
    ) -> Self {
        Self {
            rigs,
            disabled,
            subscriptions,
        }
    }

    pub async fn dispatch(
        &self,
        method: &str,
        params: Json,
        peer: SocketAddr,
    ) -> Result<Json, RpcFailure> {
        match method {
            "list_rigs" => Ok(self.list_rigs()),
            "get_capabilities" => {
                let params: RigParams = parse(params)?;
                self.get_capabilities(&params.rig_id)
            }
            "get_status" => {
                let params: RigParams = parse(params)?;
                self.get_status(&params.rig_id).await
            }
            "execute_command" => {
                let params: ExecuteParams = parse(params)?;
                self.execute_command(params).await
            }
            "subscribe_status" => {
                let params: SubscribeParams = parse(params)?;
                self.subscribe_status(params, peer).await
            }
            "unsubscribe_status" => {
                let params: UnsubscribeParams = parse(params)?;
                self.unsubscribe_status(params, peer).await
            }
            other => Err(RpcFailure::method_not_found(other)),
        }
    }

    fn rig(&self, rig_id: &str) -> Result<&RigHandle, RpcFailure> {
        if let Some(handle) = self.rigs.get(rig_id) {
            return Ok(handle);
        }
        if self.disabled.contains(rig_id) {
            return Err(RpcFailure::new(
                codes::RIG_COMMUNICATION_ERROR,
                format!("rig `{rig_id}` is disabled"),
            ));
        }
        Err(RpcFailure::unknown_rig(rig_id))
    }

    fn list_rigs(&self) -> Json {
        let mut rigs = Map::new();
        for (id, handle) in &self.rigs {
            rigs.insert(id.clone(), Json::Bool(handle.state().is_connected()));
        }
        for id in &self.disabled {
            rigs.insert(id.clone(), Json::Bool(false));
        }
        Json::Object(rigs)
    }

    fn get_capabilities(&self, rig_id: &str) -> Result<Json, RpcFailure> {
        let handle = self.rig(rig_id)?;
        let model = handle.model();
        let schema = model.schema();

        let mut commands = Map::new();
        for (name, _) in model.commands() {
            // Model ⊆ Schema, so the signature is always present.
            let Some(signature) = schema.command(name) else {
                continue;
            };
            let mut parameters = Map::new();
            for parameter in signature.parameters() {
                parameters.insert(
                    parameter.name.clone(),
                    Json::String(wire_type(&parameter.ty).to_owned()),
                );
            }
            commands.insert(name.to_owned(), json!({ "parameters": parameters }));
        }

        let mut status_fields = Map::new();
        for (_, poll) in model.status_polls() {
            for (field, _) in poll.fields() {
                if let Some(parameter) = schema.status().get(field) {
                    status_fields.insert(
                        field.clone(),
                        Json::String(wire_type(&parameter.ty).to_owned()),
                    );
                }
            }
        }

        Ok(json!({ "commands": commands, "status_fields": status_fields }))
    }

    async fn get_status(&self, rig_id: &str) -> Result<Json, RpcFailure> {
        let handle = self.rig(rig_id)?;
        let status = handle.status().await?;
        serde_json::to_value(status)
            .map_err(|error| RpcFailure::new(codes::INTERNAL_ERROR, error.to_string()))
    }

    async fn execute_command(&self, params: ExecuteParams) -> Result<Json, RpcFailure> {
        let handle = self.rig(&params.rig_id)?;
        let model = handle.model();

        if model.command(&params.command).is_none() {
            return Err(RpcFailure::new(
                codes::INVALID_COMMAND_PARAMETERS,
                format!("command `{}` is not supported by this rig", params.command),
            ));
        }
        // Present iff the model binding above is (Model ⊆ Schema).
        let signature = model.schema().command(&params.command).ok_or_else(|| {
            RpcFailure::new(codes::INTERNAL_ERROR, "model/schema disagree on command")
        })?;

        let mut args = BTreeMap::new();
        for parameter in signature.parameters() {
            let supplied = params.parameters.get(&parameter.name).ok_or_else(|| {
                RpcFailure::new(
                    codes::INVALID_COMMAND_PARAMETERS,
                    format!("missing parameter `{}`", parameter.name),
                )
            })?;
            let value = coerce_param(parameter, supplied)?;
            args.insert(parameter.name.clone(), value);
        }

        handle.execute(params.command, args).await?;
        Ok(json!({ "success": true }))
    }

    async fn subscribe_status(
        &self,
        params: SubscribeParams,
        peer: SocketAddr,
    ) -> Result<Json, RpcFailure> {
        let handle = self.rig(&params.rig_id)?;
        let schema = handle.model().schema();

        if params.fields.is_empty() {
            return Err(RpcFailure::new(
                codes::SUBSCRIPTION_ERROR,
                "subscription needs at least one field",
            ));
        }
        for field in &params.fields {
            if schema.status().get(field).is_none() {
                return Err(RpcFailure::new(
                    codes::SUBSCRIPTION_ERROR,
                    format!("unknown status field `{field}`"),
                ));
            }
        }

        let (reply, registered) = oneshot::channel();
        self.subscriptions
            .send(SubscribeRequest::Subscribe {
                peer,
                rig_id: params.rig_id,
                fields: params.fields.into_iter().collect(),
                reply,
            })
            .await
            .map_err(|_| RpcFailure::new(codes::INTERNAL_ERROR, "subscription manager gone"))?;
        let subscription_id = registered
            .await
            .map_err(|_| RpcFailure::new(codes::INTERNAL_ERROR, "subscription manager gone"))?;

        Ok(json!({ "subscription_id": subscription_id }))
    }

    async fn unsubscribe_status(
        &self,
        params: UnsubscribeParams,
        peer: SocketAddr,
    ) -> Result<Json, RpcFailure> {
        let (reply, removed) = oneshot::channel();
        self.subscriptions
            .send(SubscribeRequest::Unsubscribe {
                peer,
                subscription_id: params.subscription_id,
                reply,
            })
            .await
            .map_err(|_| RpcFailure::new(codes::INTERNAL_ERROR, "subscription manager gone"))?;
        removed
            .await
            .map_err(|_| RpcFailure::new(codes::INTERNAL_ERROR, "subscription manager gone"))??;

        Ok(json!({ "success": true }))
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Json) -> Result<T, RpcFailure> {
    serde_json::from_value(params).map_err(|error| RpcFailure::invalid_params(error.to_string()))
}

/// The client-facing type label: `int`/`bool` are numbers, enums strings.
fn wire_type(ty: &Type) -> &'static str {
    match ty {
        Type::Int | Type::Bool => "number",
        Type::Enum(_) => "string",
    }
}

/// Coerces one client-supplied JSON value to its declared type.
fn coerce_param(parameter: &Parameter, supplied: &Json) -> Result<Value, RpcFailure> {
    let invalid = |expected: &str| {
        RpcFailure::new(
            codes::INVALID_COMMAND_PARAMETERS,
            format!(
                "parameter `{}` expects {expected}, got {supplied}",
                parameter.name
            ),
        )
    };

    match &parameter.ty {
        Type::Int => supplied
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Value::Int)
            .ok_or_else(|| invalid("an unsigned 32-bit integer")),
        Type::Bool => supplied
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| invalid("a boolean")),
        Type::Enum(_) => supplied
            .as_str()
            .map(|member| Value::Enum(member.to_owned()))
            .ok_or_else(|| invalid("an enum member name")),
    }
}
