use crate::model::{Slot, TestCase, TestPlan};

/// One unit of generation work: a test case without a validated SQL artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub category: String,
    pub slot: Slot,
    pub test_case: TestCase,
}

/// Test cases whose `sql` is empty or blank, in category order then list order.
///
/// An empty result is the quiescence condition for the fan-out stage.
pub fn pending_work(plan: &TestPlan) -> Vec<WorkItem> {
    plan.iter()
        .filter(|(_, tc)| tc.is_pending())
        .map(|(slot, tc)| WorkItem {
            category: plan.categories[slot.category].name.clone(),
            slot,
            test_case: tc.clone(),
        })
        .collect()
}
