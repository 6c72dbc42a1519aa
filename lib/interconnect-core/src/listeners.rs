//! Listener configuration generator
//!
//! The listener order and field values produced here are observable: the
//! router logs one `Configured Listener:` line per entry, in order, and those
//! lines are matched literally by anything verifying a deployment.

use crate::plan::Role;

/// Router version shipped in the default image
pub const ROUTER_VERSION: &str = "1.8.0";
/// Protocol every generated listener accepts
pub const LISTENER_PROTOCOL: &str = "any";

pub const AMQP_PORT: u16 = 5672;
pub const CONSOLE_PORT: u16 = 8080;
pub const METRICS_PORT: u16 = 8888;
pub const INTER_ROUTER_PORT: u16 = 55672;
pub const EDGE_PORT: u16 = 45672;

const ANY_HOST: &str = "0.0.0.0";

/// Connection role of a listener
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerRole {
    Normal,
    InterRouter,
    Edge,
}

impl ListenerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerRole::Normal => "normal",
            ListenerRole::InterRouter => "inter-router",
            ListenerRole::Edge => "edge",
        }
    }
}

/// A single router listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerEntry {
    /// Name used for the listener, its container port and its service port
    pub name: &'static str,
    /// Bind host; empty binds every interface without naming one
    pub host: &'static str,
    pub port: u16,
    pub protocol: &'static str,
    pub role: ListenerRole,
    pub http: bool,
    /// Serves `/healthz` and `/metrics`
    pub metrics: bool,
}

impl ListenerEntry {
    fn new(name: &'static str, host: &'static str, port: u16, role: ListenerRole) -> Self {
        Self {
            name,
            host,
            port,
            protocol: LISTENER_PROTOCOL,
            role,
            http: false,
            metrics: false,
        }
    }

    fn with_http(mut self) -> Self {
        self.http = true;
        self
    }

    fn with_metrics(mut self) -> Self {
        self.metrics = true;
        self
    }

    /// Address as the router reports it, e.g. `0.0.0.0:5672` or `:8888`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The line the router logs when it configures this listener
    pub fn configured_line(&self) -> String {
        let mut line = format!(
            "Configured Listener: {} proto={}, role={}",
            self.address(),
            self.protocol,
            self.role.as_str()
        );
        if self.http {
            line.push_str(", http");
        }
        line
    }
}

/// Generate the ordered listener set for a router role.
///
/// Every router gets data, console and metrics listeners; interior routers
/// additionally accept inter-router and edge connections.
pub fn listeners_for(role: Role) -> Vec<ListenerEntry> {
    let mut listeners = vec![
        ListenerEntry::new("amqp", ANY_HOST, AMQP_PORT, ListenerRole::Normal),
        ListenerEntry::new("console", ANY_HOST, CONSOLE_PORT, ListenerRole::Normal).with_http(),
        ListenerEntry::new("metrics", "", METRICS_PORT, ListenerRole::Normal)
            .with_http()
            .with_metrics(),
    ];

    if role == Role::Interior {
        listeners.push(ListenerEntry::new(
            "inter-router",
            ANY_HOST,
            INTER_ROUTER_PORT,
            ListenerRole::InterRouter,
        ));
        listeners.push(ListenerEntry::new(
            "edge",
            ANY_HOST,
            EDGE_PORT,
            ListenerRole::Edge,
        ));
    }

    listeners
}

/// Version banner logged by the default router image
pub fn version_banner() -> String {
    format!("Version: {}", ROUTER_VERSION)
}

/// Render the router configuration file for a role and its listeners
pub fn render_router_config(role: Role, listeners: &[ListenerEntry]) -> String {
    let mut conf = format!(
        "router {{\n    mode: {}\n    id: Router.${{HOSTNAME}}\n}}\n",
        role.as_str()
    );

    for listener in listeners {
        conf.push_str("\nlistener {\n");
        conf.push_str(&format!("    name: {}\n", listener.name));
        if !listener.host.is_empty() {
            conf.push_str(&format!("    host: {}\n", listener.host));
        }
        conf.push_str(&format!("    port: {}\n", listener.port));
        conf.push_str(&format!("    role: {}\n", listener.role.as_str()));
        if listener.http {
            conf.push_str("    http: true\n");
        }
        if listener.metrics {
            conf.push_str("    healthz: true\n    metrics: true\n");
        }
        conf.push_str("}\n");
    }

    conf
}
