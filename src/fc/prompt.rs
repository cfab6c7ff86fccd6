use crate::protocol::canonical::ToolDefinition;

use super::parser::{TOOL_CODE_CLOSE, TOOL_CODE_OPEN_PREFIX};

/// Heading that marks a system prompt as already carrying tool instructions.
pub const XML_INSTRUCTIONS_HEADING: &str = "# TOOL CALLING FORMAT";

/// True when `system_prompt` already contains the XML tool instructions.
#[must_use]
pub fn has_xml_tool_instructions(system_prompt: &str) -> bool {
    system_prompt.contains(XML_INSTRUCTIONS_HEADING)
        && system_prompt.contains(TOOL_CODE_OPEN_PREFIX)
}

// ---------------------------------------------------------------------------
// Tool list formatting
// ---------------------------------------------------------------------------

fn format_param_detail(p_name: &str, p_info: &serde_json::Value, required: &[&str]) -> Vec<String> {
    let p_type = p_info
        .get("type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("any");
    let is_required = if required.contains(&p_name) { "Yes" } else { "No" };

    let mut lines = vec![
        format!("    - {p_name}:"),
        format!("      - type: {p_type}"),
        format!("      - required: {is_required}"),
    ];
    if let Some(desc) = p_info.get("description").and_then(serde_json::Value::as_str) {
        lines.push(format!("      - description: {}", escape_text(desc)));
    }
    if let Some(values) = p_info.get("enum") {
        lines.push(format!("      - enum: {values}"));
    }
    if let Some(default) = p_info.get("default") {
        lines.push(format!("      - default: {default}"));
    }
    lines
}

fn format_tool(tool: &ToolDefinition) -> String {
    let description = tool.description.as_deref().unwrap_or("");
    let schema = serde_json::to_string_pretty(&tool.input_schema)
        .unwrap_or_else(|_| tool.input_schema.to_string());

    let mut out = format!(
        "- **{}**: {}\n  Parameters: {schema}",
        tool.name,
        escape_text(description)
    );

    let required: Vec<&str> = tool
        .input_schema
        .get("required")
        .and_then(serde_json::Value::as_array)
        .map(|items| items.iter().filter_map(serde_json::Value::as_str).collect())
        .unwrap_or_default();
    if let Some(props) = tool
        .input_schema
        .get("properties")
        .and_then(serde_json::Value::as_object)
        .filter(|props| !props.is_empty())
    {
        out.push_str("\n  Parameter details:");
        for (p_name, p_info) in props {
            for line in format_param_detail(p_name, p_info, &required) {
                out.push('\n');
                out.push_str(&line);
            }
        }
    }
    out
}

fn escape_text(text: &str) -> std::borrow::Cow<'_, str> {
    quick_xml::escape::escape(text)
}

// ---------------------------------------------------------------------------
// Prompt template
// ---------------------------------------------------------------------------

fn instructions_template(tools_list: &str) -> String {
    let open = TOOL_CODE_OPEN_PREFIX;
    let close = TOOL_CODE_CLOSE;
    format!(
        r#"
{XML_INSTRUCTIONS_HEADING}

You are required to use tools to fetch information or perform actions.
To invoke a tool, you MUST use the following EXACT XML format.
ANY deviation from this format will cause the tool call to fail.

{open} name="TOOL_NAME">
{{"argument_name": "value"}}
{close}

## CRITICAL EXECUTION RULES:
1. **NO Markdown**: Do NOT wrap the XML in ```xml or ``` code blocks. Output the raw XML tags directly.
2. **Valid JSON**: The content between the tags MUST be valid, parseable JSON.
   - Use double quotes for keys and string values.
   - No trailing commas.
   - No comments using // or /*.
3. **Exact Name Match**: The `name` attribute MUST match a tool name from the "Available Tools" list exactly (case-sensitive).
4. **No Nested Content**: The JSON parameters must be the direct child of `tool_code`. Do not nest another `tool` or `function` tag inside.
5. **Thinking**: If you need to think or explain your reasoning, do so in text BEFORE the `<tool_code>` block. Do NOT put thoughts inside the tool code.
6. **Multiple Tools**: You may call multiple tools in sequence by outputting multiple `<tool_code>` blocks.
7. **Tool Outputs**: Tool results will be provided to you in the following format:
<tool_output name="TOOL_NAME">
{{result_json_or_text}}
</tool_output>

## EXAMPLE (Correct):
Thinking: I need to read the file.
{open} name="Read">
{{"file_path": "src/utils.py"}}
{close}

## EXAMPLES (Incorrect - DO NOT USE):
Wrapped in code blocks:
```xml
{open} name="Read">...{close}
```

Nested tags:
{open}><tool name="Read">...</tool>{close}

Invalid JSON (keys not quoted):
{open} name="Read">
{{file_path: "src/utils.py"}}
{close}

## Available Tools:

{tools_list}
"#
    )
}

/// Build the system-prompt block that teaches the model the `<tool_code>`
/// grammar and lists every tool with its input schema.
#[must_use]
pub fn generate_xml_tool_instructions(tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let tools_list = tools
        .iter()
        .map(format_tool)
        .collect::<Vec<_>>()
        .join("\n\n");
    instructions_template(&tools_list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, desc: Option<&str>, schema: serde_json::Value) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: desc.map(str::to_string),
            input_schema: schema,
        }
    }

    #[test]
    fn test_instructions_list_every_tool() {
        let prompt = generate_xml_tool_instructions(&[
            tool(
                "read_file",
                Some("Read a file from disk"),
                json!({"type":"object","properties":{"path":{"type":"string","description":"Path"}},"required":["path"]}),
            ),
            tool("list", None, json!({"type":"object"})),
        ]);
        assert!(prompt.contains(XML_INSTRUCTIONS_HEADING));
        assert!(prompt.contains("- **read_file**: Read a file from disk"));
        assert!(prompt.contains("- **list**: "));
        assert!(prompt.contains("<tool_code name=\"TOOL_NAME\">"));
        assert!(prompt.contains("      - required: Yes"));
        assert!(prompt.contains("\"required\": [\n"));
        assert!(has_xml_tool_instructions(&prompt));
    }

    #[test]
    fn test_empty_tools_produce_empty_instructions() {
        assert_eq!(generate_xml_tool_instructions(&[]), "");
    }

    #[test]
    fn test_descriptions_are_escaped() {
        let prompt = generate_xml_tool_instructions(&[tool(
            "cmp",
            Some("returns a < b & c"),
            json!({"type":"object"}),
        )]);
        assert!(prompt.contains("returns a &lt; b &amp; c"));
    }

    #[test]
    fn test_enum_and_default_details() {
        let prompt = generate_xml_tool_instructions(&[tool(
            "set_mode",
            Some("Set mode"),
            json!({"type":"object","properties":{"mode":{"type":"string","enum":["fast","slow"],"default":"fast"}}}),
        )]);
        assert!(prompt.contains("      - enum: [\"fast\",\"slow\"]"));
        assert!(prompt.contains("      - default: \"fast\""));
        assert!(prompt.contains("      - required: No"));
    }

    #[test]
    fn test_detection_requires_heading_and_tag() {
        assert!(has_xml_tool_instructions("# TOOL CALLING FORMAT\n<tool_code name='t'>"));
        assert!(!has_xml_tool_instructions("Normal system prompt"));
    }
}
