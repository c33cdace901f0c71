use crate::error::RoutingRejection;
use crate::frame::Envelope;
use crate::records::{ACTUATOR_KEY, AGGREGATE_STATUS_KEY, Category, SENSOR_KEY, Side, SubRecord};
use log::debug;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct Routed {
    pub records: Vec<SubRecord>,
    pub rejections: Vec<RoutingRejection>,
}

impl Routed {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Splits an envelope into its well-formed sub-records. A malformed
/// category is rejected on its own; siblings are unaffected. Unknown
/// top-level keys are ignored.
pub fn route_envelope(envelope: &Envelope) -> Routed {
    let mut routed = Routed::default();

    if let Some(payload) = envelope.get(AGGREGATE_STATUS_KEY) {
        push(&mut routed, parse_category(Category::AggregateStatus, payload));
    }

    if let Some(actuator) = envelope.get(ACTUATOR_KEY) {
        match actuator.as_object() {
            Some(sides) => {
                for side in [Side::Left, Side::Right] {
                    if let Some(payload) = sides.get(side.key()) {
                        push(&mut routed, parse_category(Category::Actuator(side), payload));
                    }
                }
            }
            None => routed.rejections.push(RoutingRejection::NotAnObject {
                category: ACTUATOR_KEY,
            }),
        }
    }

    if let Some(payload) = envelope.get(SENSOR_KEY) {
        push(&mut routed, parse_category(Category::Sensor, payload));
    }

    for rejection in &routed.rejections {
        debug!("dropping sub-record: {}", rejection);
    }
    routed
}

fn push(routed: &mut Routed, parsed: Result<SubRecord, RoutingRejection>) {
    match parsed {
        Ok(record) => routed.records.push(record),
        Err(rejection) => routed.rejections.push(rejection),
    }
}

fn parse_category(category: Category, payload: &Value) -> Result<SubRecord, RoutingRejection> {
    let label = category.label();
    let obj = payload
        .as_object()
        .ok_or(RoutingRejection::NotAnObject { category: label })?;

    let schema = category.fields();
    if obj.len() < schema.len() {
        return Err(RoutingRejection::TooFewFields {
            category: label,
            expected: schema.len(),
            found: obj.len(),
        });
    }

    let values = schema
        .iter()
        .map(|&field| {
            obj.get(field)
                .and_then(Value::as_f64)
                .ok_or(RoutingRejection::NonNumericField {
                    category: label,
                    field,
                })
        })
        .collect::<Result<Vec<f64>, _>>()?;

    SubRecord::from_values(category, &values).ok_or(RoutingRejection::TooFewFields {
        category: label,
        expected: schema.len(),
        found: values.len(),
    })
}
