//! Research budget tracking
//!
//! The checks are pure functions over an explicit tracker and budget. A job
//! owns exactly one tracker; concurrent workers share it through [`SharedBudget`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::{BudgetExceedReason, BudgetStats, ResearchBudget};

/// Mutable counters of one job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetTracker {
    pub tokens_used: u64,
    pub llm_calls: u32,
    pub iterations_by_context: BTreeMap<String, u32>,
    pub total_iterations: u32,
    pub exceeded: bool,
    pub exceed_reason: Option<BudgetExceedReason>,
    pub monitor_warnings: Vec<String>,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iterations_for(&self, context_id: &str) -> u32 {
        self.iterations_by_context.get(context_id).copied().unwrap_or(0)
    }

    pub fn stats(&self, budget: &ResearchBudget) -> BudgetStats {
        BudgetStats {
            tokens_used: self.tokens_used,
            llm_calls: self.llm_calls,
            total_iterations: self.total_iterations,
            iterations_by_context: self.iterations_by_context.clone(),
            budget_exceeded: self.exceeded,
            exceed_reason: self.exceed_reason.clone(),
            max_total_iterations: budget.max_total_iterations,
            max_iterations_per_context: budget.max_iterations_per_context,
            max_total_tokens: budget.max_total_tokens,
            enforce_hard: budget.enforce_hard,
            monitor_warnings: self.monitor_warnings.clone(),
        }
    }
}

/// Outcome of a budget check.
///
/// In monitor-only mode a crossed limit is `allowed` with `reason` and `warning` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub reason: Option<BudgetExceedReason>,
    pub warning: Option<String>,
}

impl BudgetCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            warning: None,
        }
    }

    fn limit_reached(reason: BudgetExceedReason, budget: &ResearchBudget) -> Self {
        if budget.enforce_hard {
            Self {
                allowed: false,
                reason: Some(reason),
                warning: None,
            }
        } else {
            let warning = format!("budget limit crossed (monitor only): {}", reason);
            Self {
                allowed: true,
                reason: Some(reason),
                warning: Some(warning),
            }
        }
    }
}

/// May `context_id` start another research iteration?
pub fn check_scope_iteration_budget(
    tracker: &BudgetTracker,
    budget: &ResearchBudget,
    context_id: &str,
) -> BudgetCheck {
    if tracker.iterations_for(context_id) >= budget.max_iterations_per_context {
        return BudgetCheck::limit_reached(
            BudgetExceedReason::ScopeIterations {
                context_id: context_id.to_string(),
                limit: budget.max_iterations_per_context,
            },
            budget,
        );
    }

    if tracker.total_iterations >= budget.max_total_iterations {
        return BudgetCheck::limit_reached(
            BudgetExceedReason::TotalIterations {
                limit: budget.max_total_iterations,
            },
            budget,
        );
    }

    BudgetCheck::allow()
}

/// May an LLM call of `tokens` estimated tokens proceed?
pub fn check_token_budget(tracker: &BudgetTracker, budget: &ResearchBudget, tokens: u64) -> BudgetCheck {
    if tokens > budget.max_tokens_per_call {
        return BudgetCheck::limit_reached(
            BudgetExceedReason::TokensPerCall {
                requested: tokens,
                limit: budget.max_tokens_per_call,
            },
            budget,
        );
    }

    if tracker.tokens_used.saturating_add(tokens) > budget.max_total_tokens {
        return BudgetCheck::limit_reached(
            BudgetExceedReason::TotalTokens {
                limit: budget.max_total_tokens,
            },
            budget,
        );
    }

    BudgetCheck::allow()
}

pub fn record_iteration(tracker: &mut BudgetTracker, context_id: &str) {
    *tracker
        .iterations_by_context
        .entry(context_id.to_string())
        .or_insert(0) += 1;
    tracker.total_iterations += 1;
}

pub fn record_llm_call(tracker: &mut BudgetTracker, tokens: u64) {
    tracker.llm_calls += 1;
    tracker.tokens_used = tracker.tokens_used.saturating_add(tokens);
}

/// Flag the job as over budget. Only the first reason is kept.
pub fn mark_budget_exceeded(tracker: &mut BudgetTracker, reason: BudgetExceedReason) {
    if tracker.exceeded {
        return;
    }
    tracing::info!(reason = %reason, "Research budget exceeded");
    tracker.exceeded = true;
    tracker.exceed_reason = Some(reason);
}

fn note_warning(tracker: &mut BudgetTracker, check: &BudgetCheck) {
    if let Some(warning) = &check.warning {
        tracing::warn!(warning = %warning, "Budget limit crossed in monitor-only mode");
        if !tracker.monitor_warnings.contains(warning) {
            tracker.monitor_warnings.push(warning.clone());
        }
    }
}

/// The job's single budget tracker, shared by all research workers.
///
/// Check-and-record happens under one lock so no update is lost between
/// concurrent workers.
#[derive(Clone)]
pub struct SharedBudget {
    budget: Arc<ResearchBudget>,
    tracker: Arc<Mutex<BudgetTracker>>,
}

impl SharedBudget {
    pub fn new(budget: ResearchBudget) -> Self {
        Self {
            budget: Arc::new(budget),
            tracker: Arc::new(Mutex::new(BudgetTracker::new())),
        }
    }

    pub fn budget(&self) -> &ResearchBudget {
        &self.budget
    }

    fn lock(&self) -> MutexGuard<'_, BudgetTracker> {
        // Counters stay consistent even if a worker panicked while holding the lock
        self.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check the iteration budget for `context_id` and record the iteration if allowed
    pub fn try_begin_iteration(&self, context_id: &str) -> BudgetCheck {
        let mut tracker = self.lock();
        let check = check_scope_iteration_budget(&tracker, &self.budget, context_id);

        if check.allowed {
            note_warning(&mut tracker, &check);
            record_iteration(&mut tracker, context_id);
        } else if let Some(reason) = &check.reason {
            mark_budget_exceeded(&mut tracker, reason.clone());
        }

        check
    }

    /// Check the token budget for a call; an allowed reservation counts as an LLM call
    pub fn try_reserve_tokens(&self, tokens: u64) -> BudgetCheck {
        let mut tracker = self.lock();
        let check = check_token_budget(&tracker, &self.budget, tokens);

        if check.allowed {
            note_warning(&mut tracker, &check);
            record_llm_call(&mut tracker, tokens);
        } else if let Some(reason) = &check.reason {
            mark_budget_exceeded(&mut tracker, reason.clone());
        }

        check
    }

    /// Correct a reservation with the provider-reported usage
    pub fn adjust_tokens(&self, reserved: u64, actual: u64) {
        let mut tracker = self.lock();
        tracker.tokens_used = tracker
            .tokens_used
            .saturating_sub(reserved)
            .saturating_add(actual);
    }

    pub fn mark_exceeded(&self, reason: BudgetExceedReason) {
        mark_budget_exceeded(&mut self.lock(), reason);
    }

    pub fn stats(&self) -> BudgetStats {
        self.lock().stats(&self.budget)
    }
}
