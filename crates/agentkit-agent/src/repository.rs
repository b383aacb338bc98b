//! Persistence for goals and plans.
//!
//! Planners save every goal and plan they create or execute through a
//! [`PlanRepository`].  [`InMemoryPlanRepository`] keeps them for the life of
//! the process; substitute a durable implementation to survive restarts.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::goal::{Goal, Plan};

/// CRUD store for goals and plans.
#[async_trait]
pub trait PlanRepository: Send + Sync {
    /// Insert or replace a goal.
    async fn save_goal(&self, goal: &Goal) -> Result<()>;

    async fn get_goal(&self, goal_id: Uuid) -> Result<Option<Goal>>;

    /// Returns whether the goal existed.
    async fn delete_goal(&self, goal_id: Uuid) -> Result<bool>;

    /// All goals, oldest first.
    async fn list_goals(&self) -> Result<Vec<Goal>>;

    /// Insert or replace a plan.
    async fn save_plan(&self, plan: &Plan) -> Result<()>;

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>>;

    /// Returns whether the plan existed.
    async fn delete_plan(&self, plan_id: Uuid) -> Result<bool>;

    /// Plans created for `goal_id`, oldest first.
    async fn plans_for_goal(&self, goal_id: Uuid) -> Result<Vec<Plan>>;
}

/// Process-local [`PlanRepository`].
#[derive(Debug, Default)]
pub struct InMemoryPlanRepository {
    goals: DashMap<Uuid, Goal>,
    plans: DashMap<Uuid, Plan>,
}

impl InMemoryPlanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn goal_count(&self) -> usize {
        self.goals.len()
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }
}

#[async_trait]
impl PlanRepository for InMemoryPlanRepository {
    async fn save_goal(&self, goal: &Goal) -> Result<()> {
        self.goals.insert(goal.id, goal.clone());
        Ok(())
    }

    async fn get_goal(&self, goal_id: Uuid) -> Result<Option<Goal>> {
        Ok(self.goals.get(&goal_id).map(|g| g.clone()))
    }

    async fn delete_goal(&self, goal_id: Uuid) -> Result<bool> {
        Ok(self.goals.remove(&goal_id).is_some())
    }

    async fn list_goals(&self) -> Result<Vec<Goal>> {
        let mut goals: Vec<Goal> = self.goals.iter().map(|g| g.clone()).collect();
        goals.sort_by_key(|g| (g.created_at, g.id));
        Ok(goals)
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        self.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>> {
        Ok(self.plans.get(&plan_id).map(|p| p.clone()))
    }

    async fn delete_plan(&self, plan_id: Uuid) -> Result<bool> {
        Ok(self.plans.remove(&plan_id).is_some())
    }

    async fn plans_for_goal(&self, goal_id: Uuid) -> Result<Vec<Plan>> {
        let mut plans: Vec<Plan> = self
            .plans
            .iter()
            .filter(|p| p.goal.id == goal_id)
            .map(|p| p.clone())
            .collect();
        plans.sort_by_key(|p| (p.created_at, p.id));
        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::PlanStep;

    #[tokio::test]
    async fn goal_crud() {
        let repo = InMemoryPlanRepository::new();
        let goal = Goal::new("g", "desc");

        repo.save_goal(&goal).await.unwrap();
        assert_eq!(repo.get_goal(goal.id).await.unwrap(), Some(goal.clone()));
        assert_eq!(repo.list_goals().await.unwrap().len(), 1);

        assert!(repo.delete_goal(goal.id).await.unwrap());
        assert!(!repo.delete_goal(goal.id).await.unwrap());
        assert!(repo.get_goal(goal.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plans_are_grouped_by_goal() {
        let repo = InMemoryPlanRepository::new();
        let goal = Goal::new("g", "");
        let other = Goal::new("other", "");

        let first = Plan::new(goal.clone(), vec![PlanStep::tool("a")]);
        let second = Plan::new(goal.clone(), Vec::new());
        let unrelated = Plan::new(other, Vec::new());
        for plan in [&first, &second, &unrelated] {
            repo.save_plan(plan).await.unwrap();
        }

        let ids: Vec<Uuid> = repo
            .plans_for_goal(goal.id)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(repo.plan_count(), 3);

        assert!(repo.delete_plan(first.id).await.unwrap());
        assert!(repo.get_plan(first.id).await.unwrap().is_none());
    }
}
