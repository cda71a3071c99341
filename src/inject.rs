use serde_json::{json, Map, Value};

/// Instruction appended to every inbound generation request so the model
/// terminates its response with the completion marker the stream supervisor
/// looks for.
pub const DONE_INSTRUCTION: &str = "IMPORTANT: At the very end of your entire response, you must \
     write the token [done] to signal completion. This is a mandatory technical requirement.";

const CANONICAL_FIELD: &str = "systemInstruction";
const LEGACY_FIELD: &str = "system_instruction";

/// Inject the completion-marker system instruction into a generation request.
///
/// The two historical spellings of the system-instruction field are first
/// unified into `systemInstruction`, with the legacy field's parts prepended
/// to any existing canonical parts. The instruction part is then appended.
/// A missing or malformed field is replaced with a single-part instruction.
pub fn inject_done_instruction(body: &mut Map<String, Value>) {
    let instruction_part = json!({ "text": DONE_INSTRUCTION });

    merge_legacy_spelling(body);

    let Some(instruction) = body.get_mut(CANONICAL_FIELD).and_then(Value::as_object_mut) else {
        // Missing, null, or wrong type: overwrite with a fresh single-part field.
        body.insert(
            CANONICAL_FIELD.to_string(),
            json!({ "parts": [instruction_part] }),
        );
        return;
    };

    match instruction.get_mut("parts").and_then(Value::as_array_mut) {
        Some(parts) => parts.push(instruction_part),
        None => {
            instruction.insert("parts".to_string(), json!([instruction_part]));
        }
    }
}

/// Fold `system_instruction` into `systemInstruction`, prepending its parts.
fn merge_legacy_spelling(body: &mut Map<String, Value>) {
    let Some(legacy) = body.remove(LEGACY_FIELD) else {
        return;
    };

    let mut legacy_parts = legacy
        .as_object()
        .and_then(|obj| obj.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let canonical_parts = body
        .get(CANONICAL_FIELD)
        .and_then(Value::as_object)
        .and_then(|obj| obj.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    legacy_parts.extend(canonical_parts);
    body.insert(
        CANONICAL_FIELD.to_string(),
        json!({ "parts": legacy_parts }),
    );
}
