//! Home Assistant device discovery, derived from the profile alone

use serde_json::{json, Value};

use crate::config::Profile;
use crate::message::Publish;
use crate::Result;

pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// Topic of the single device discovery document
pub fn discovery_topic(profile: &Profile) -> String {
    format!(
        "{DISCOVERY_PREFIX}/device/{}/config",
        profile.home_assistant.device_id
    )
}

fn device_descriptor(profile: &Profile) -> Value {
    let ha = &profile.home_assistant;
    let mut device = json!({
        "identifiers": [format!("lightspeed-mqtt:{}", ha.device_id)],
        "name": ha.device_name,
        "manufacturer": ha.manufacturer,
        "model": ha.model,
        "sw_version": profile.schema_revision(),
    });
    if let Some(area) = &ha.area {
        device["suggested_area"] = json!(area);
    }
    device
}

fn component(profile: &Profile, suffix: &str, name: &str, platform: &str) -> Value {
    let id = format!("{}_{suffix}", profile.home_assistant.device_id);
    json!({
        "platform": platform,
        "unique_id": id,
        "object_id": id,
        "name": format!("{} {name}", profile.home_assistant.device_name),
    })
}

fn merge(mut base: Value, extra: Value) -> Value {
    if let (Value::Object(base_map), Value::Object(extra_map)) = (&mut base, extra) {
        base_map.extend(extra_map);
    }
    base
}

/// Builds the discovery document for the whole device
pub fn discovery_document(profile: &Profile) -> Value {
    let topics = &profile.topics;

    let light = merge(
        component(profile, "light", "Light", "light"),
        json!({
            "schema": "default",
            "command_topic": topics.command,
            "state_topic": topics.state,
            "state_value_template": "{{ value_json.state }}",
            "payload_on": "ON",
            "payload_off": "OFF",
            "rgb_command_topic": topics.rgb,
            "rgb_state_topic": topics.state,
            "rgb_value_template": "{{ value_json.last_color | join(',') }}",
            "brightness_command_topic": topics.brightness,
            "brightness_state_topic": topics.state,
            "brightness_value_template": "{{ value_json.last_brightness }}",
            "brightness_scale": 255,
            "json_attributes_topic": topics.state,
        }),
    );

    let button = |suffix: &str, name: &str, topic: &str| {
        merge(
            component(profile, suffix, name, "button"),
            json!({ "command_topic": topic, "payload_press": "" }),
        )
    };

    let mode_switch = merge(
        component(profile, "mode", "Pilot Mode", "switch"),
        json!({
            "command_topic": topics.mode,
            "state_topic": topics.mode,
            "payload_on": "pilot",
            "payload_off": "logi",
            "state_on": "pilot",
            "state_off": "logi",
        }),
    );

    let availability_sensor = merge(
        component(profile, "availability", "Availability", "binary_sensor"),
        json!({
            "state_topic": topics.availability,
            "payload_on": "online",
            "payload_off": "offline",
            "device_class": "connectivity",
        }),
    );

    let mode_sensor = merge(
        component(profile, "mode_state", "Current Mode", "sensor"),
        json!({
            "state_topic": topics.state,
            "value_template": "{{ value_json.mode }}",
        }),
    );

    json!({
        "device": device_descriptor(profile),
        "origin": { "name": "lightspeed-mqtt", "sw_version": env!("CARGO_PKG_VERSION") },
        "availability": [{
            "topic": topics.availability,
            "payload_available": "online",
            "payload_not_available": "offline",
        }],
        "components": {
            "light": light,
            "alert_button": button("alert", "Alert", &topics.alert),
            "warning_button": button("warning", "Warning", &topics.warn),
            "info_button": button("info", "Info", &topics.info),
            "mode_switch": mode_switch,
            "availability_sensor": availability_sensor,
            "mode_sensor": mode_sensor,
        },
    })
}

/// Retained publishes announcing the device
pub fn discovery_messages(profile: &Profile) -> Result<Vec<Publish>> {
    let payload = serde_json::to_string(&discovery_document(profile))?;
    Ok(vec![Publish::retained(discovery_topic(profile), payload)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        let text = r#"
            [mqtt]
            host = "h"
            [topics]
            base = "desk/led"
            [home_assistant]
            device_id = "desk"
            device_name = "Desk"
            area = "Office"
        "#;
        Profile::from_toml_str(text, "config.toml", |_| None).unwrap()
    }

    #[test]
    fn single_retained_device_message() {
        let messages = discovery_messages(&profile()).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "homeassistant/device/desk/config");
        assert!(messages[0].retain);
    }

    #[test]
    fn components_point_at_profile_topics() {
        let profile = profile();
        let doc = discovery_document(&profile);
        let components = &doc["components"];

        assert_eq!(components["light"]["command_topic"], "desk/led/switch");
        assert_eq!(components["light"]["rgb_command_topic"], "desk/led/rgb/set");
        assert_eq!(components["light"]["brightness_state_topic"], "desk/led/status");
        assert_eq!(components["alert_button"]["command_topic"], "desk/led/alert");
        assert_eq!(components["warning_button"]["command_topic"], "desk/led/warn");
        assert_eq!(components["info_button"]["unique_id"], "desk_info");
        assert_eq!(components["mode_switch"]["payload_on"], "pilot");
        assert_eq!(components["availability_sensor"]["state_topic"], "desk/led/availability");
        assert_eq!(components["mode_sensor"]["platform"], "sensor");
    }

    #[test]
    fn device_carries_schema_revision_and_area() {
        let profile = profile();
        let doc = discovery_document(&profile);

        assert_eq!(doc["device"]["sw_version"], profile.schema_revision());
        assert_eq!(doc["device"]["suggested_area"], "Office");
        assert_eq!(doc["device"]["name"], "Desk");
    }
}
