use crate::error::KitError;

pub const TOPIC_MAX: usize = 128;
pub const PAYLOAD_MAX: usize = 128;

const SHADOW_DELTA_TOPIC: &str = "$aws/things/{thing}/shadow/update/delta";
const SHADOW_UPDATE_TOPIC: &str = "$aws/things/{thing}/shadow/update";

pub fn shadow_delta_topic(thing_name: &str) -> Result<String, KitError> {
    fill(SHADOW_DELTA_TOPIC, thing_name)
}

pub fn shadow_update_topic(thing_name: &str) -> Result<String, KitError> {
    fill(SHADOW_UPDATE_TOPIC, thing_name)
}

fn fill(template: &str, thing_name: &str) -> Result<String, KitError> {
    if thing_name.is_empty() || thing_name.contains(['/', '+', '#']) {
        return Err(KitError::BadParam);
    }
    let topic = template.replace("{thing}", thing_name);
    if topic.len() >= TOPIC_MAX {
        return Err(KitError::BadParam);
    }
    Ok(topic)
}
