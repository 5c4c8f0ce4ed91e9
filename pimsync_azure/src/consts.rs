pub const AUTH_HEADER: &str = "Authorization";
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
pub const ACCEPT_HEADER: &str = "Accept";
pub const USER_AGENT_HEADER: &str = "User-Agent";
pub const USER_AGENT: &str = "pimsync";

pub const DEFAULT_ARM_URL: &str = "https://management.azure.com";
pub const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com";

/// Token scopes are fixed, even when the endpoints are overridden
pub const ARM_TOKEN_SCOPE: &str = "https://management.azure.com/.default";
pub const GRAPH_TOKEN_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Schedules, schedule requests and policies
pub const PIM_API_VERSION: &str = "2020-10-01";
/// Role definitions and role assignments
pub const RBAC_API_VERSION: &str = "2022-04-01";

pub const AUTHORIZATION_PROVIDER: &str = "providers/Microsoft.Authorization";

/// The only roles PIM for Groups knows about
pub const GROUP_ROLES: [&str; 2] = ["member", "owner"];
