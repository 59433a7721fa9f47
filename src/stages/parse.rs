//! 阶段输出解析：思考文本、计划步骤、执行动作

use std::sync::OnceLock;

use regex::Regex;

static STEP_MARKER_RE: OnceLock<Regex> = OnceLock::new();

/// 步骤标记：`1.` / `2)` / `Step 3:` / `-` / `*` / `•` / `+`，标记后须有空白或行尾
fn step_marker() -> &'static Regex {
    STEP_MARKER_RE.get_or_init(|| {
        Regex::new(r"^(?:(?i:step)\s*\d+\s*[.):]?|\d+[.)]|[-*•+])(?:\s+|$)").unwrap()
    })
}

/// 只由标记符号组成的行（Markdown 分隔线等）
fn is_rule(line: &str) -> bool {
    line.chars()
        .all(|c| matches!(c, '-' | '*' | '•' | '+' | '_' | '=' | '#') || c.is_whitespace())
}

/// 推理输出：去除首尾空白后不得为空
pub fn thought(text: &str) -> Result<String, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("reasoning output is empty".to_string());
    }
    Ok(trimmed.to_string())
}

/// 计划输出：带标记的行开启新步骤，无标记的行续接当前步骤，首个标记前的引言忽略；
/// 全文没有任何标记时，整段文本作为唯一步骤
pub fn plan_steps(text: &str) -> Result<Vec<String>, String> {
    let marker = step_marker();
    let mut steps: Vec<String> = Vec::new();
    let mut unmarked: Vec<&str> = Vec::new();
    let mut marked = false;

    for line in text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_rule(l))
    {
        if let Some(m) = marker.find(line) {
            marked = true;
            steps.push(line[m.end()..].trim().to_string());
        } else if let Some(current) = steps.last_mut() {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(line);
        } else {
            unmarked.push(line);
        }
    }

    if !marked {
        steps = vec![unmarked.join(" ")];
    }
    steps.retain(|s| !s.is_empty());
    if steps.is_empty() {
        return Err("plan output is empty".to_string());
    }
    Ok(steps)
}

/// 执行输出：移除 NUL 字节、去除首尾空白，长度不少于 min_chars 个字符
pub fn action(text: &str, min_chars: usize) -> Result<String, String> {
    let cleaned = text.replace('\0', "");
    let trimmed = cleaned.trim();
    let len = trimmed.chars().count();
    if len < min_chars {
        return Err(format!(
            "execution output too short ({len} chars, need at least {min_chars})"
        ));
    }
    Ok(trimmed.to_string())
}
