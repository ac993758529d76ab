//! Wire Codec
//!
//! JSON wire forms for tasks and resume data. Tasks serialize to an object
//! with enums as zero-based ordinals; resume data travels as a positional
//! list `[task_json, data, required_start_byte, etag?]`.

use serde_json::{json, Value};

use super::resume::ResumeData;
use super::Task;
use crate::error::{TaskError, TaskResult};

/// Task -> wire JSON object.
pub fn task_to_json(task: &Task) -> Value {
    // enum ordinals come from the manual Serialize impls on the enums
    serde_json::to_value(task).unwrap_or(Value::Null)
}

/// Wire JSON object -> Task.
pub fn task_from_json(value: &Value) -> TaskResult<Task> {
    serde_json::from_value(value.clone())
        .map_err(|e| TaskError::General(format!("cannot decode task: {e}")))
}

/// Task -> wire JSON string.
pub fn task_to_json_string(task: &Task) -> String {
    task_to_json(task).to_string()
}

/// Wire JSON string -> Task.
pub fn task_from_json_string(text: &str) -> TaskResult<Task> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| TaskError::General(format!("bad task JSON: {e}")))?;
    task_from_json(&value)
}

/// Resume data -> wire list `[task_json, data, required_start_byte, etag?]`.
pub fn resume_data_to_wire(task: &Task, resume: &ResumeData) -> Value {
    let mut list = vec![
        task_to_json(task),
        json!(resume.data),
        json!(resume.required_start_byte),
    ];
    if let Some(etag) = &resume.etag {
        list.push(json!(etag));
    }
    Value::Array(list)
}

/// Wire list -> (Task, ResumeData).
pub fn resume_data_from_wire(value: &Value) -> TaskResult<(Task, ResumeData)> {
    let list = value
        .as_array()
        .ok_or_else(|| TaskError::General("resume data wire form must be a list".into()))?;
    if list.len() < 3 {
        return Err(TaskError::General(
            "resume data wire form needs at least 3 elements".into(),
        ));
    }
    let task = task_from_json(&list[0])?;
    let data = list[1]
        .as_str()
        .ok_or_else(|| TaskError::General("resume data payload must be a string".into()))?
        .to_string();
    let required_start_byte = list[2]
        .as_u64()
        .ok_or_else(|| TaskError::General("requiredStartByte must be an integer".into()))?;
    let etag = list.get(3).and_then(|v| v.as_str()).map(str::to_string);
    Ok((
        task.clone(),
        ResumeData::new(task.task_id, data, required_start_byte, etag),
    ))
}
