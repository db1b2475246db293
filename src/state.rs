use std::sync::Arc;

use sendie_core::{AllowList, RateLimiter, SessionRegistry};

use crate::config::Config;
use crate::hub::Hub;

pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub allow_list: Arc<AllowList>,
    pub hub: Arc<Hub>,
}
