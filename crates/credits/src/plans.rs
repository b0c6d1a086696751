//! Plan catalog
//!
//! Static mapping from plan tier to entitlements and from action kind to
//! per-unit credit cost. Read-only at runtime; all limit checks and cost
//! computations go through this module.

use plume_shared::Plan;
use serde::{Deserialize, Serialize};

/// Entitlements for a plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanEntitlements {
    pub plan: Plan,
    pub ai_credits_per_month: i64,
    pub max_workspaces: u32,
    pub max_team_members: u32,
    pub max_storage_gb: i64,
    /// Daily cap on generated posts (tweets + threads).
    pub max_posts_per_day: i64,
    pub can_generate_images: bool,
    pub can_generate_videos: bool,
    pub can_buy_credits: bool,
}

impl PlanEntitlements {
    /// Free tier: 25 credits/month, text generation only.
    pub fn free() -> Self {
        Self {
            plan: Plan::Free,
            ai_credits_per_month: 25,
            max_workspaces: 1,
            max_team_members: 1,
            max_storage_gb: 1,
            max_posts_per_day: 5,
            can_generate_images: false,
            can_generate_videos: false,
            can_buy_credits: false,
        }
    }

    /// Solo tier: 500 credits/month, image generation enabled.
    pub fn solo() -> Self {
        Self {
            plan: Plan::Solo,
            ai_credits_per_month: 500,
            max_workspaces: 3,
            max_team_members: 1,
            max_storage_gb: 10,
            max_posts_per_day: 30,
            can_generate_images: true,
            can_generate_videos: false,
            can_buy_credits: true,
        }
    }

    /// Team tier: 2,000 credits/month, video generation enabled.
    pub fn team() -> Self {
        Self {
            plan: Plan::Team,
            ai_credits_per_month: 2_000,
            max_workspaces: 10,
            max_team_members: 5,
            max_storage_gb: 50,
            max_posts_per_day: 100,
            can_generate_images: true,
            can_generate_videos: true,
            can_buy_credits: true,
        }
    }

    /// Agency tier: 10,000 credits/month, effectively uncapped posting.
    pub fn agency() -> Self {
        Self {
            plan: Plan::Agency,
            ai_credits_per_month: 10_000,
            max_workspaces: 25,
            max_team_members: 15,
            max_storage_gb: 250,
            max_posts_per_day: i64::MAX,
            can_generate_images: true,
            can_generate_videos: true,
            can_buy_credits: true,
        }
    }

    /// Legacy enterprise tier, grandfathered at agency-level entitlements.
    pub fn enterprise() -> Self {
        Self {
            plan: Plan::Enterprise,
            ..Self::agency()
        }
    }

    /// Look up the entitlements for a plan.
    pub fn for_plan(plan: Plan) -> Self {
        match plan {
            Plan::Free => Self::free(),
            Plan::Solo => Self::solo(),
            Plan::Team => Self::team(),
            Plan::Agency => Self::agency(),
            Plan::Enterprise => Self::enterprise(),
        }
    }
}

/// Credit-consuming action kinds.
///
/// `Refund` appears in the transaction log only; it has no unit cost and is
/// never a valid debit action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    TweetGeneration,
    ThreadGeneration,
    AiVideo,
    AiImage,
    TweetRewrite,
    Storage,
    Refund,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::TweetGeneration => "tweet_generation",
            ActionKind::ThreadGeneration => "thread_generation",
            ActionKind::AiVideo => "ai_video",
            ActionKind::AiImage => "ai_image",
            ActionKind::TweetRewrite => "tweet_rewrite",
            ActionKind::Storage => "storage",
            ActionKind::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tweet_generation" => Some(ActionKind::TweetGeneration),
            "thread_generation" => Some(ActionKind::ThreadGeneration),
            "ai_video" => Some(ActionKind::AiVideo),
            "ai_image" => Some(ActionKind::AiImage),
            "tweet_rewrite" => Some(ActionKind::TweetRewrite),
            "storage" => Some(ActionKind::Storage),
            "refund" => Some(ActionKind::Refund),
            _ => None,
        }
    }

    /// Credits charged per unit of this action (per request, per image,
    /// per GB for storage). `None` for refund.
    pub fn unit_cost(&self) -> Option<i64> {
        match self {
            ActionKind::TweetGeneration | ActionKind::ThreadGeneration => Some(10),
            ActionKind::AiVideo => Some(20),
            ActionKind::AiImage => Some(2),
            ActionKind::TweetRewrite => Some(1),
            ActionKind::Storage => Some(2),
            ActionKind::Refund => None,
        }
    }

    /// Whether this action counts against the daily posting cap.
    pub fn counts_as_post(&self) -> bool {
        matches!(
            self,
            ActionKind::TweetGeneration | ActionKind::ThreadGeneration
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Total credit cost of `quantity` units of `action`.
///
/// Returns `None` for refunds and on overflow.
pub fn credit_cost(action: ActionKind, quantity: i64) -> Option<i64> {
    if quantity <= 0 {
        return None;
    }
    action.unit_cost()?.checked_mul(quantity)
}
