//! Flat, typed projection of GTFS-RT vehicle position entities.
//!
//! Optional wire fields stay `None` when the message leaves them unset; a
//! zero is only ever reported when the feed actually sent a zero. The one
//! exception is `schedule_relationship`, which falls back to `SCHEDULED` like
//! the wire format itself does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::gtfs_rt::FeedEntity;

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal {
        $($variant:ident = $value:literal => $label:literal),+ $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant,)+
        }

        impl $name {
            /// Maps the raw protobuf enum value.
            pub fn from_wire(value: i32) -> Result<Self> {
                match value {
                    $($value => Ok($name::$variant),)+
                    _ => Err(Error::InvalidEnumValue { field: $field, value }),
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(
    /// How the trip relates to the static schedule.
    ScheduleRelationship, "schedule_relationship" {
        Scheduled = 0 => "SCHEDULED",
        Added = 1 => "ADDED",
        Unscheduled = 2 => "UNSCHEDULED",
        Canceled = 3 => "CANCELED",
        Replacement = 5 => "REPLACEMENT",
        Duplicated = 6 => "DUPLICATED",
        Deleted = 7 => "DELETED",
        New = 8 => "NEW",
    }
);

wire_enum!(
    VehicleStopStatus, "current_status" {
        IncomingAt = 0 => "INCOMING_AT",
        StoppedAt = 1 => "STOPPED_AT",
        InTransitTo = 2 => "IN_TRANSIT_TO",
    }
);

wire_enum!(
    CongestionLevel, "congestion_level" {
        UnknownCongestionLevel = 0 => "UNKNOWN_CONGESTION_LEVEL",
        RunningSmoothly = 1 => "RUNNING_SMOOTHLY",
        StopAndGo = 2 => "STOP_AND_GO",
        Congestion = 3 => "CONGESTION",
        SevereCongestion = 4 => "SEVERE_CONGESTION",
    }
);

wire_enum!(
    OccupancyStatus, "occupancy_status" {
        Empty = 0 => "EMPTY",
        ManySeatsAvailable = 1 => "MANY_SEATS_AVAILABLE",
        FewSeatsAvailable = 2 => "FEW_SEATS_AVAILABLE",
        StandingRoomOnly = 3 => "STANDING_ROOM_ONLY",
        CrushedStandingRoomOnly = 4 => "CRUSHED_STANDING_ROOM_ONLY",
        Full = 5 => "FULL",
        NotAcceptingPassengers = 6 => "NOT_ACCEPTING_PASSENGERS",
        NoDataAvailable = 7 => "NO_DATA_AVAILABLE",
        NotBoardable = 8 => "NOT_BOARDABLE",
    }
);

/// One decoded vehicle position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehiclePosition {
    pub entity_id: String,

    // Trip
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<u32>,
    pub start_date: Option<String>,
    pub start_time: Option<String>,
    /// `start_date` + `start_time` in the agency's timezone.
    pub start_datetime: Option<DateTime<Tz>>,
    pub schedule_relationship: ScheduleRelationship,

    // Vehicle
    pub vehicle_id: String,
    pub vehicle_label: Option<String>,
    pub vehicle_license_plate: Option<String>,

    // Position
    pub latitude: f32,
    pub longitude: f32,
    pub bearing: Option<f32>,
    pub odometer: Option<f64>,
    pub speed: Option<f32>,

    // Stop
    pub current_stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    pub current_status: Option<VehicleStopStatus>,

    pub timestamp: u64,
    pub timestamp_datetime: DateTime<Utc>,

    pub congestion_level: Option<CongestionLevel>,
    pub occupancy_status: Option<OccupancyStatus>,
    pub occupancy_percentage: Option<u32>,
}

impl VehiclePosition {
    /// Decodes one feed entity. `timezone` is the agency's local zone, used
    /// only for `start_datetime`.
    ///
    /// # Errors
    ///
    /// [`Error::NotAVehicleEntity`] when the entity carries no vehicle
    /// payload, [`Error::MissingRequiredField`] when the vehicle id, position,
    /// latitude, longitude, or timestamp is absent, and
    /// [`Error::InvalidEnumValue`] for enum values outside the known set.
    pub fn from_entity(entity: &FeedEntity, timezone: Tz) -> Result<Self> {
        let missing = |field: &'static str| Error::MissingRequiredField {
            entity_id: entity.id.clone(),
            field,
        };

        let vehicle = entity
            .vehicle
            .as_ref()
            .ok_or_else(|| Error::NotAVehicleEntity {
                entity_id: entity.id.clone(),
            })?;

        let descriptor = vehicle.vehicle.as_ref();
        let vehicle_id = descriptor
            .and_then(|d| d.id.clone())
            .ok_or_else(|| missing("vehicle_id"))?;

        let position = vehicle.position.as_ref().ok_or_else(|| missing("position"))?;
        let latitude = position.latitude.ok_or_else(|| missing("latitude"))?;
        let longitude = position.longitude.ok_or_else(|| missing("longitude"))?;

        let timestamp = vehicle.timestamp.ok_or_else(|| missing("timestamp"))?;
        let timestamp_datetime = i64::try_from(timestamp)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or(Error::InvalidTimestamp(timestamp))?;

        let trip = vehicle.trip.as_ref();
        let start_date = trip.and_then(|t| t.start_date.clone());
        let start_time = trip.and_then(|t| t.start_time.clone());
        let start_datetime = match (&start_date, &start_time) {
            (Some(date), Some(time)) => match parse_start_datetime(date, time, timezone) {
                Ok(dt) => Some(dt),
                Err(e) => {
                    warn!(entity_id = %entity.id, error = %e, "Leaving start_datetime unset");
                    None
                }
            },
            _ => None,
        };

        let schedule_relationship = trip
            .and_then(|t| t.schedule_relationship)
            .map(ScheduleRelationship::from_wire)
            .transpose()?
            .unwrap_or(ScheduleRelationship::Scheduled);

        Ok(VehiclePosition {
            entity_id: entity.id.clone(),
            trip_id: trip.and_then(|t| t.trip_id.clone()),
            route_id: trip.and_then(|t| t.route_id.clone()),
            direction_id: trip.and_then(|t| t.direction_id),
            start_date,
            start_time,
            start_datetime,
            schedule_relationship,
            vehicle_id,
            vehicle_label: descriptor.and_then(|d| d.label.clone()),
            vehicle_license_plate: descriptor.and_then(|d| d.license_plate.clone()),
            latitude,
            longitude,
            bearing: position.bearing,
            odometer: position.odometer,
            speed: position.speed,
            current_stop_sequence: vehicle.current_stop_sequence,
            stop_id: vehicle.stop_id.clone(),
            current_status: vehicle
                .current_status
                .map(VehicleStopStatus::from_wire)
                .transpose()?,
            timestamp,
            timestamp_datetime,
            congestion_level: vehicle
                .congestion_level
                .map(CongestionLevel::from_wire)
                .transpose()?,
            occupancy_status: vehicle
                .occupancy_status
                .map(OccupancyStatus::from_wire)
                .transpose()?,
            occupancy_percentage: vehicle.occupancy_percentage,
        })
    }

    /// String form of a field, as compared by [`VehicleFilter`]. `None` when
    /// the field is unset.
    pub fn field_value(&self, field: VehicleField) -> Option<String> {
        fn text(value: &Option<String>) -> Option<String> {
            value.clone()
        }
        fn show<T: ToString>(value: Option<T>) -> Option<String> {
            value.map(|v| v.to_string())
        }

        match field {
            VehicleField::EntityId => Some(self.entity_id.clone()),
            VehicleField::TripId => text(&self.trip_id),
            VehicleField::RouteId => text(&self.route_id),
            VehicleField::DirectionId => show(self.direction_id),
            VehicleField::StartDate => text(&self.start_date),
            VehicleField::StartTime => text(&self.start_time),
            VehicleField::StartDatetime => self.start_datetime.map(|dt| dt.to_rfc3339()),
            VehicleField::ScheduleRelationship => Some(self.schedule_relationship.to_string()),
            VehicleField::VehicleId => Some(self.vehicle_id.clone()),
            VehicleField::VehicleLabel => text(&self.vehicle_label),
            VehicleField::VehicleLicensePlate => text(&self.vehicle_license_plate),
            VehicleField::Latitude => Some(self.latitude.to_string()),
            VehicleField::Longitude => Some(self.longitude.to_string()),
            VehicleField::Bearing => show(self.bearing),
            VehicleField::Odometer => show(self.odometer),
            VehicleField::Speed => show(self.speed),
            VehicleField::CurrentStopSequence => show(self.current_stop_sequence),
            VehicleField::StopId => text(&self.stop_id),
            VehicleField::CurrentStatus => show(self.current_status),
            VehicleField::Timestamp => Some(self.timestamp.to_string()),
            VehicleField::TimestampDatetime => Some(self.timestamp_datetime.to_rfc3339()),
            VehicleField::CongestionLevel => show(self.congestion_level),
            VehicleField::OccupancyStatus => show(self.occupancy_status),
            VehicleField::OccupancyPercentage => show(self.occupancy_percentage),
        }
    }
}

/// Combines a GTFS `YYYYMMDD` service date and `HH:MM:SS` start time in
/// `timezone`.
///
/// Hours of 24 and above roll into the following day(s), so `25:10:00` on
/// `20240215` is 01:10 on February 16th. Local times that do not exist
/// (spring-forward gap) are rejected; ambiguous ones resolve to the earlier
/// instant.
pub fn parse_start_datetime(date: &str, time: &str, timezone: Tz) -> Result<DateTime<Tz>> {
    let invalid = || Error::InvalidTimeFormat {
        date: date.to_string(),
        time: time.to_string(),
    };

    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let day = NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| invalid())?;

    let mut parts = time.split(':');
    let (Some(h), Some(m), Some(s), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    let number = |part: &str, max_len: usize| -> Result<u32> {
        if part.is_empty() || part.len() > max_len || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        part.parse().map_err(|_| invalid())
    };
    let (hours, minutes, seconds) = (number(h, 3)?, number(m, 2)?, number(s, 2)?);

    let clock = NaiveTime::from_hms_opt(hours % 24, minutes, seconds).ok_or_else(invalid)?;
    let local = day
        .checked_add_days(Days::new(u64::from(hours / 24)))
        .ok_or_else(invalid)?
        .and_time(clock);

    timezone
        .from_local_datetime(&local)
        .earliest()
        .ok_or_else(invalid)
}

macro_rules! vehicle_fields {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Addressable fields of [`VehiclePosition`], by their snake_case name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum VehicleField {
            $($variant,)+
        }

        impl VehicleField {
            pub const ALL: &'static [VehicleField] = &[$(VehicleField::$variant,)+];

            pub fn name(&self) -> &'static str {
                match self {
                    $(VehicleField::$variant => $name,)+
                }
            }
        }

        impl FromStr for VehicleField {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(VehicleField::$variant),)+
                    other => Err(Error::UnknownField(other.to_string())),
                }
            }
        }
    };
}

vehicle_fields! {
    EntityId => "entity_id",
    TripId => "trip_id",
    RouteId => "route_id",
    DirectionId => "direction_id",
    StartDate => "start_date",
    StartTime => "start_time",
    StartDatetime => "start_datetime",
    ScheduleRelationship => "schedule_relationship",
    VehicleId => "vehicle_id",
    VehicleLabel => "vehicle_label",
    VehicleLicensePlate => "vehicle_license_plate",
    Latitude => "latitude",
    Longitude => "longitude",
    Bearing => "bearing",
    Odometer => "odometer",
    Speed => "speed",
    CurrentStopSequence => "current_stop_sequence",
    StopId => "stop_id",
    CurrentStatus => "current_status",
    Timestamp => "timestamp",
    TimestampDatetime => "timestamp_datetime",
    CongestionLevel => "congestion_level",
    OccupancyStatus => "occupancy_status",
    OccupancyPercentage => "occupancy_percentage",
}

impl fmt::Display for VehicleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Exact string-equality conditions, all of which must hold.
///
/// An unset field never matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleFilter {
    conditions: Vec<(VehicleField, String)>,
}

impl VehicleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a filter from `(field name, value)` pairs, rejecting unknown
    /// field names up front.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut filter = Self::new();
        for (key, value) in pairs {
            filter = filter.with(key.as_ref().parse()?, value);
        }
        Ok(filter)
    }

    pub fn with(mut self, field: VehicleField, value: impl Into<String>) -> Self {
        self.conditions.push((field, value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, record: &VehiclePosition) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| record.field_value(*field).as_deref() == Some(expected.as_str()))
    }
}
