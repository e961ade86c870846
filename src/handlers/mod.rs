pub mod dispatcher;
pub mod handle_member;
pub mod handle_message;

use crate::captcha::CaptchaCoordinator;
use crate::config::EngineConfig;
use crate::enforcement::EnforcementSink;
use crate::engine::DecisionEngine;
use crate::flood_detector::FloodDetector;
use crate::gban::GbanManager;
use crate::pattern_matcher::PatternMatcher;
use crate::roles::RoleResolver;
use crate::spam_scorer::SpamScorer;
use crate::storage::StateStore;
use std::sync::Arc;

/// Shared handles injected into every handler through the dispatcher.
pub struct AppContext {
    pub config: EngineConfig,
    pub store: Arc<dyn StateStore>,
    pub matcher: Arc<PatternMatcher>,
    pub resolver: Arc<RoleResolver>,
    pub scorer: Arc<SpamScorer>,
    pub flood: Arc<FloodDetector>,
    pub engine: Arc<DecisionEngine>,
    pub captcha: Arc<CaptchaCoordinator>,
    pub gban: Arc<GbanManager>,
    pub sink: Arc<dyn EnforcementSink>,
}
