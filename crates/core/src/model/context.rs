//! Connection context: the IP and DNS state negotiated along the chain.

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Route {
    pub prefix: String,
}

impl Route {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IpContext {
    pub src_ip_addrs: Vec<String>,
    pub dst_ip_addrs: Vec<String>,
    pub src_routes: Vec<Route>,
    pub dst_routes: Vec<Route>,
    /// Prefixes the allocator must stay out of.
    pub excluded_prefixes: Vec<String>,
    /// Additional prefixes handed to the client (vL3).
    pub extra_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DnsConfig {
    pub dns_server_ips: Vec<String>,
    pub search_domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DnsContext {
    pub configs: Vec<DnsConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConnectionContext {
    pub ip_context: IpContext,
    pub dns_context: DnsContext,
    pub extra_context: std::collections::HashMap<String, String>,
}
