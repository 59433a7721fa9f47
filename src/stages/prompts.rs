//! 三个阶段的系统提示词与 Prompt 模板

use crate::core::{Context, Task};

pub const REASONING_SYSTEM: &str = "You are an analytical reasoning engine. Examine the task and its \
context carefully, identify the key concerns, constraints and open questions, and explain your analysis clearly.";

pub const PLANNING_SYSTEM: &str =
    "You are a strategic planner focused on breaking down tasks into actionable steps.";

pub const EXECUTION_SYSTEM: &str =
    "You are an execution engine focused on taking concrete actions based on plans.";

pub fn reasoning_prompt(task: &Task, context: &Context) -> String {
    format!(
        "Context:\n{}\n\nAnalyze this: {}",
        context.to_lines(),
        task.text()
    )
}

pub fn planning_prompt(task: &Task, context: &Context, thought: &str) -> String {
    format!(
        r#"Create a detailed, step-by-step plan for the following task.
Consider:
1. Dependencies and prerequisites
2. Resource requirements
3. Potential challenges
4. Success criteria

Context:
{}

Task:
{}

Provide a numbered list of concrete steps:"#,
        join_context(thought, context),
        task.text()
    )
}

pub fn execution_prompt(task: &Task, context: &Context, thought: &str, plan: &[String]) -> String {
    format!(
        r#"Generate specific actions or responses based on this plan and context.
Consider:
1. Required resources and dependencies
2. Error handling and edge cases
3. Success criteria and validation
4. User experience and clarity

Context:
{}

Task:
{}

Plan:
{}

Generate detailed execution steps or response:"#,
        join_context(thought, context),
        task.text(),
        numbered(plan)
    )
}

/// 前序阶段输出在前，调用方上下文键值行在后
fn join_context(thought: &str, context: &Context) -> String {
    if context.is_empty() {
        thought.to_string()
    } else {
        format!("{}\n{}", thought, context.to_lines())
    }
}

fn numbered(plan: &[String]) -> String {
    plan.iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step))
        .collect::<Vec<_>>()
        .join("\n")
}
