//! Messages exchanged with the parent shell application.
//!
//! The catalogue runs as a plugin inside a shell that owns navigation and
//! the user session. Messages use the shell's action envelope:
//! `{"type": "scigateway:api:<action>", "payload": ...}`.

use serde::{Deserialize, Serialize};

/// Prefix shared by every shell action type.
pub const MICRO_FRONTEND_ID: &str = "scigateway";

/// A navigation entry registered with the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRoute {
    pub section: String,
    pub link: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_from_menu: Option<bool>,
    pub order: i32,
}

/// Actions sent to the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PluginMessage {
    #[serde(rename = "scigateway:api:register_route")]
    RegisterRoute(PluginRoute),
    #[serde(rename = "scigateway:api:plugin_rerender")]
    RequestPluginRerender,
    /// The session is no longer valid; the shell signs the user out.
    #[serde(rename = "scigateway:api:signout")]
    SignOut,
}

impl PluginMessage {
    /// The action type string carried in the envelope.
    pub fn action_type(&self) -> String {
        let action = match self {
            PluginMessage::RegisterRoute(_) => "register_route",
            PluginMessage::RequestPluginRerender => "plugin_rerender",
            PluginMessage::SignOut => "signout",
        };
        format!("{}:api:{}", MICRO_FRONTEND_ID, action)
    }
}

/// Registration messages for the configured routes, in menu order.
pub fn route_registrations(routes: &[PluginRoute]) -> Vec<PluginMessage> {
    let mut routes = routes.to_vec();
    routes.sort_by_key(|r| r.order);
    routes.into_iter().map(PluginMessage::RegisterRoute).collect()
}
