use crate::reading::{Granularity, Reading, DAY_SAMPLE, MONTH_SAMPLE, WEEK_SAMPLE, YEAR_SAMPLE};

pub const DAY_COUNT: usize = 600;
pub const WEEK_COUNT: usize = 600;
pub const MONTH_COUNT: usize = 600;
pub const YEAR_COUNT: usize = 2 * 366;

/// Slot 0 holds the most recent raw reading, slot 1 the accumulator for the
/// day bucket currently being averaged, and the rest the four rings.
pub const SLOT_COUNT: usize = 2 + DAY_COUNT + WEEK_COUNT + MONTH_COUNT + YEAR_COUNT;

const DAY_FIRST: usize = 2;
const WEEK_FIRST: usize = DAY_FIRST + DAY_COUNT;
const MONTH_FIRST: usize = WEEK_FIRST + WEEK_COUNT;
const YEAR_FIRST: usize = MONTH_FIRST + MONTH_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphSpan {
    Day,
    Week,
    Month,
    Year,
}

impl GraphSpan {
    pub const ALL: [GraphSpan; 4] = [
        GraphSpan::Day,
        GraphSpan::Week,
        GraphSpan::Month,
        GraphSpan::Year,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            GraphSpan::Day => "day",
            GraphSpan::Week => "week",
            GraphSpan::Month => "month",
            GraphSpan::Year => "year",
        }
    }
}

/// Fixed-footprint multi-resolution history for one device, styled after an
/// MRTG log: stacked day/week/month/year rings where each coarser ring is
/// promoted from averages of the finer one.
#[derive(Debug, Clone, Default)]
pub struct MrtgSeries {
    slots: Vec<Reading>,
}

impl MrtgSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a cache file. Anything but a full set of slots is
    /// rejected so a truncated cache cannot poison the rings.
    pub fn from_slots(slots: Vec<Reading>) -> Option<Self> {
        (slots.len() == SLOT_COUNT).then_some(Self { slots })
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Reading] {
        &self.slots
    }

    /// Most recent raw reading, if any update has arrived.
    pub fn current(&self) -> Option<&Reading> {
        self.slots.first()
    }

    /// Insert a reading. Stale readings (no newer than the current slot) do
    /// not bump the current slot or the accumulator, but the promotion
    /// check still runs so replayed history settles into the rings. Invalid
    /// readings are dropped silently.
    pub fn update(&mut self, value: &Reading) {
        if !value.is_valid() {
            return;
        }
        if self.slots.is_empty() {
            self.seed(value);
        } else if value.time > self.slots[0].time {
            self.slots[0] = *value;
            let mut accumulator = self.slots[1];
            accumulator.fold(value);
            self.slots[1] = accumulator;
        }

        let mut promoted = false;
        while self.slots[1].time - self.slots[DAY_FIRST].time > DAY_SAMPLE {
            promoted = true;
            self.promote_day_slot();
        }
        if promoted {
            self.slots[1] = Reading::default();
        }
    }

    /// First insert: fill every ring with invalid placeholders carrying
    /// descending timestamps, so the next genuine insert promotes exactly
    /// once instead of spinning through the whole ring.
    fn seed(&mut self, value: &Reading) {
        self.slots = vec![Reading::default(); SLOT_COUNT];
        self.slots[0] = *value;
        self.slots[1] = *value;
        for index in 0..DAY_COUNT {
            self.slots[index + DAY_FIRST].time = self.slots[index + DAY_FIRST - 1].time - DAY_SAMPLE;
        }
        for index in 0..WEEK_COUNT {
            self.slots[index + WEEK_FIRST].time =
                self.slots[index + WEEK_FIRST - 1].time - WEEK_SAMPLE;
        }
        for index in 0..MONTH_COUNT {
            self.slots[index + MONTH_FIRST].time =
                self.slots[index + MONTH_FIRST - 1].time - MONTH_SAMPLE;
        }
        for index in 0..YEAR_COUNT {
            self.slots[index + YEAR_FIRST].time =
                self.slots[index + YEAR_FIRST - 1].time - YEAR_SAMPLE;
        }
    }

    /// Move the accumulator into the day ring and cascade into the coarser
    /// rings according to the slot's wall-clock granularity.
    fn promote_day_slot(&mut self) {
        self.shift_right(DAY_FIRST, DAY_COUNT);
        let mut head = self.slots[1];
        head.normalize_time(Granularity::Day);
        if head.time - self.slots[DAY_FIRST + 1].time > DAY_SAMPLE {
            head.time = self.slots[DAY_FIRST + 1].time + DAY_SAMPLE;
        }
        self.slots[DAY_FIRST] = head;

        let granularity = head.time_granularity();
        if granularity == Granularity::Year {
            let day_of_samples = self.sum_day_slots(12 * 24);
            self.shift_right(YEAR_FIRST, YEAR_COUNT);
            self.slots[YEAR_FIRST] = day_of_samples;
        }
        if matches!(granularity, Granularity::Year | Granularity::Month) {
            let two_hours = self.sum_day_slots(12 * 2);
            self.shift_right(MONTH_FIRST, MONTH_COUNT);
            self.slots[MONTH_FIRST] = two_hours;
        }
        if matches!(
            granularity,
            Granularity::Year | Granularity::Month | Granularity::Week
        ) {
            let half_hour = self.sum_day_slots(6);
            self.shift_right(WEEK_FIRST, WEEK_COUNT);
            self.slots[WEEK_FIRST] = half_hour;
        }
    }

    fn shift_right(&mut self, first: usize, count: usize) {
        self.slots.copy_within(first..first + count - 1, first + 1);
    }

    /// Average of the newest `count` day slots, stopping at the first
    /// invalid one.
    fn sum_day_slots(&self, count: usize) -> Reading {
        let mut sum = Reading::default();
        for slot in &self.slots[DAY_FIRST..DAY_FIRST + count] {
            if !slot.is_valid() {
                break;
            }
            sum.fold(slot);
        }
        sum
    }

    /// Contiguous view of one ring, truncated at the first uninitialized
    /// slot. The day view reports the freshest raw timestamp in its first
    /// entry so chart captions show when data last arrived.
    pub fn snapshot(&self, span: GraphSpan) -> Vec<Reading> {
        if self.slots.is_empty() {
            return Vec::new();
        }
        let (first, count) = match span {
            GraphSpan::Day => (DAY_FIRST, DAY_COUNT),
            GraphSpan::Week => (WEEK_FIRST, WEEK_COUNT),
            GraphSpan::Month => (MONTH_FIRST, MONTH_COUNT),
            GraphSpan::Year => (YEAR_FIRST, YEAR_COUNT),
        };
        let ring = &self.slots[first..first + count];
        let valid = ring.iter().take_while(|slot| slot.is_valid()).count();
        let mut view = ring[..valid].to_vec();
        if span == GraphSpan::Day {
            if let Some(head) = view.first_mut() {
                head.time = self.slots[0].time;
            }
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceModel;
    use chrono::{Local, TimeZone};

    fn reading(time: i64, temp: f64) -> Reading {
        let mut value = Reading::new(time, temp, 45.0, 90);
        value.model = DeviceModel::H5075;
        value
    }

    fn local_midnight() -> i64 {
        Local
            .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .unwrap()
            .timestamp()
    }

    #[test]
    fn first_update_seeds_without_promotion() {
        let mut series = MrtgSeries::new();
        series.update(&reading(local_midnight(), 20.0));
        assert_eq!(series.slots().len(), SLOT_COUNT);
        assert!(series.snapshot(GraphSpan::Day).is_empty());
        assert_eq!(series.current().unwrap().time, local_midnight());
    }

    #[test]
    fn invalid_readings_are_dropped() {
        let mut series = MrtgSeries::new();
        series.update(&Reading::default());
        assert!(series.is_empty());

        let mut no_model = Reading::new(1000, 20.0, 40.0, 90);
        no_model.model = DeviceModel::Unknown;
        series.update(&no_model);
        assert!(series.is_empty());
    }

    #[test]
    fn day_ring_times_step_by_sample_period() {
        let start = local_midnight();
        let mut series = MrtgSeries::new();
        for i in 0..12 {
            series.update(&reading(start + i * DAY_SAMPLE, 20.0 + i as f64));
        }
        let day = series.snapshot(GraphSpan::Day);
        assert_eq!(day.len(), 11);
        // Newest first; adjacent slots exactly one sample apart.
        for pair in day.windows(2) {
            assert_eq!(pair[0].time - pair[1].time, DAY_SAMPLE);
        }
        assert_eq!(day.last().unwrap().time, start);
    }

    #[test]
    fn rings_are_monotonically_non_increasing() {
        let start = local_midnight();
        let mut series = MrtgSeries::new();
        for i in 0..400 {
            series.update(&reading(start + i * DAY_SAMPLE, 20.0));
        }
        for span in GraphSpan::ALL {
            let view = series.snapshot(span);
            for pair in view.windows(2) {
                assert!(pair[0].time >= pair[1].time, "{span:?} ring out of order");
            }
        }
    }

    #[test]
    fn day_of_samples_promotes_one_year_slot() {
        let start = local_midnight();
        let mut series = MrtgSeries::new();
        for i in 0..289 {
            series.update(&reading(start + i * DAY_SAMPLE, 20.0));
        }
        let year = series.snapshot(GraphSpan::Year);
        assert_eq!(year.len(), 1);
        let day = series.snapshot(GraphSpan::Day);
        assert_eq!(day.last().unwrap().time, start);
    }

    #[test]
    fn week_slots_average_half_hours() {
        let start = local_midnight();
        let mut series = MrtgSeries::new();
        // Alternate 10 and 30 so promoted averages land at 20.
        for i in 0..24 {
            let temp = if i % 2 == 0 { 10.0 } else { 30.0 };
            series.update(&reading(start + i * DAY_SAMPLE, temp));
        }
        let week = series.snapshot(GraphSpan::Week);
        assert!(!week.is_empty());
        for slot in &week {
            assert!((slot.temperature[0] - 20.0).abs() < 1e-6);
            assert!(slot.temperature_min[0] <= 10.0);
            assert!(slot.temperature_max[0] >= 30.0);
        }
    }

    #[test]
    fn stale_update_does_not_bump_current() {
        let start = local_midnight();
        let mut series = MrtgSeries::new();
        series.update(&reading(start + DAY_SAMPLE, 20.0));
        series.update(&reading(start, 30.0));
        assert_eq!(series.current().unwrap().time, start + DAY_SAMPLE);
        assert!((series.current().unwrap().temperature[0] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_day_head_carries_current_time() {
        let start = local_midnight();
        let mut series = MrtgSeries::new();
        for i in 0..4 {
            series.update(&reading(start + i * DAY_SAMPLE, 20.0));
        }
        // A reading off the sample boundary still advances the reported head timestamp.
        series.update(&reading(start + 3 * DAY_SAMPLE + 60, 21.0));
        let day = series.snapshot(GraphSpan::Day);
        assert_eq!(day[0].time, start + 3 * DAY_SAMPLE + 60);
    }

    #[test]
    fn cache_round_trip_preserves_rings() {
        let start = local_midnight();
        let mut series = MrtgSeries::new();
        for i in 0..50 {
            series.update(&reading(start + i * DAY_SAMPLE, 20.0 + (i % 5) as f64));
        }
        let slots: Vec<Reading> = series.slots().to_vec();
        let restored = MrtgSeries::from_slots(slots).unwrap();
        assert_eq!(
            restored.snapshot(GraphSpan::Day).len(),
            series.snapshot(GraphSpan::Day).len()
        );
        assert_eq!(restored.current().unwrap(), series.current().unwrap());
    }

    #[test]
    fn from_slots_rejects_wrong_length() {
        assert!(MrtgSeries::from_slots(vec![Reading::default(); 10]).is_none());
    }
}
