//! A minimal MCP server for the integration tests: greets on `tools/call`,
//! answers `ping`, and echoes notifications back as server-initiated
//! `notifications/message` traffic.

use serde_json::{Value, json};

use mcp_relay::{
    McpAgent, McpServer, Properties, Transport,
    model::{ErrorData, JsonRpcMessage},
};

#[derive(Default)]
pub struct GreeterAgent {
    properties: Properties,
}

impl McpAgent for GreeterAgent {
    type Server = GreeterServer;
    type Error = std::io::Error;

    async fn init(&mut self, properties: &Properties) -> Result<(), Self::Error> {
        self.properties = properties.clone();
        Ok(())
    }

    fn server(&mut self) -> GreeterServer {
        GreeterServer {
            properties: self.properties.clone(),
        }
    }
}

pub struct GreeterServer {
    properties: Properties,
}

impl McpServer for GreeterServer {
    type Error = std::io::Error;

    async fn serve(self, mut transport: impl Transport) -> Result<(), Self::Error> {
        transport.start().map_err(std::io::Error::other)?;
        while let Some(message) = transport.receive().await {
            match message {
                JsonRpcMessage::Request(request) => {
                    let reply = match request.method.as_str() {
                        "initialize" => Ok(json!({
                            "protocolVersion": "2025-03-26",
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "greeter", "version": "0.1.0"},
                        })),
                        "ping" => Ok(json!({})),
                        "tools/list" => Ok(json!({
                            "tools": [{
                                "name": "greet",
                                "description": "Greet someone by name",
                                "inputSchema": {
                                    "type": "object",
                                    "properties": {"name": {"type": "string"}},
                                },
                            }],
                        })),
                        "tools/call" => call_tool(&self.properties, request.params.as_ref()),
                        other => Err(ErrorData::method_not_found(other)),
                    };
                    let reply = match reply {
                        Ok(result) => JsonRpcMessage::response(request.id, result),
                        Err(error) => JsonRpcMessage::error(Some(request.id), error),
                    };
                    transport
                        .send(reply, None)
                        .await
                        .map_err(std::io::Error::other)?;
                }
                JsonRpcMessage::Notification(notification)
                    if notification.method == "notifications/echo" =>
                {
                    transport
                        .send(
                            JsonRpcMessage::notification(
                                "notifications/message",
                                Some(json!({"echo": notification.params})),
                            ),
                            None,
                        )
                        .await
                        .map_err(std::io::Error::other)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn call_tool(properties: &Properties, params: Option<&Value>) -> Result<Value, ErrorData> {
    let params = params.ok_or_else(|| ErrorData::invalid_params("missing params"))?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorData::invalid_params("missing tool name"))?;
    match name {
        "greet" => {
            let who = params
                .get("arguments")
                .and_then(|arguments| arguments.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("world");
            Ok(json!({"content": [{"type": "text", "text": format!("Hello, {who}!")}]}))
        }
        "whoami" => {
            let sub = properties
                .get("sub")
                .and_then(Value::as_str)
                .unwrap_or("anonymous");
            Ok(json!({"content": [{"type": "text", "text": sub}]}))
        }
        other => Err(ErrorData::invalid_params(format!("unknown tool: {other}"))),
    }
}
