//! Storage and math for the current temperature readings

use std::time::Duration;

/// Reading reported for a slot whose optional sensor is gone
pub(crate) const UNAVAILABLE_TEMP: i32 = -128;

/// Sleep time floor applied while a temperature is rising quickly
const RUSH_SLEEPTIME: Duration = Duration::from_secs(2);

/// Index and value of the hottest biased reading
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Tmax {
    /// Slot index into the biased temperatures
    pub idx: usize,
    /// Biased temperature at that slot
    pub value: i32,
}

/// Non-owning cursor into a sensor's slot range of the [`TempState`]
///
/// Each sensor owns one, covering a range disjoint from every other
/// sensor's. A read cycle restarts the cursor and then advances it once per
/// temperature.
#[derive(Debug, Default, Clone)]
pub(crate) struct TempRef {
    /// First slot of this sensor
    start: usize,
    /// Number of slots assigned to this sensor
    len: usize,
    /// Slots consumed in the current cycle
    pos: usize,
}

impl TempRef {
    /// Rewind to the first slot; called at the start of every read
    pub(crate) fn restart(&mut self) {
        self.pos = 0;
    }

    /// Slots consumed since the last restart
    pub(crate) fn taken(&self) -> usize {
        self.pos
    }

    /// Slots still unconsumed in this cycle
    pub(crate) fn remaining(&self) -> usize {
        self.len - self.pos
    }

    /// Consume the next slot, or `None` when the range is exhausted
    fn advance(&mut self) -> Option<usize> {
        (self.pos < self.len).then(|| {
            let i = self.start + self.pos;
            self.pos += 1;
            i
        })
    }
}

/// Per-sensor temperature buffers with the anti-oscillation bias filter
///
/// Holds three aligned vectors of identical length: the last corrected
/// readings, their bias values, and the biased sums the level table is
/// compared against. Also owns the adaptive sleep time, since the bias
/// filter shortens it on sudden temperature rises.
#[derive(Debug)]
pub(crate) struct TempState {
    /// Last raw (corrected) reading per slot
    temps: Vec<i32>,
    /// Current bias per slot
    biases: Vec<f32>,
    /// `temps[i] + biases[i] as i32`, kept in sync at every write
    biased_temps: Vec<i32>,
    /// Slots already handed out to sensors
    refd_temps: usize,
    /// add/skip calls since the cycle started, for the sensor-lost check
    filled: usize,
    /// Hottest biased reading of the current cycle
    tmax: Tmax,
    /// Hottest biased reading of the previous cycle
    last_tmax: i32,
    /// Bias multiplier applied to sudden temperature jumps
    bias_level: f32,
    /// Configured cycle sleep time
    sleeptime: Duration,
    /// Adaptive sleep time, between [`RUSH_SLEEPTIME`] and `sleeptime`
    tmp_sleeptime: Duration,
}

impl TempState {
    /// Allocate buffers for `num_temps` total readings
    pub(crate) fn new(num_temps: usize, bias_level: f32, sleeptime: Duration) -> Self {
        Self {
            temps: vec![0; num_temps],
            biases: vec![0.0; num_temps],
            biased_temps: vec![0; num_temps],
            refd_temps: 0,
            filled: 0,
            tmax: Tmax {
                idx: 0,
                value: UNAVAILABLE_TEMP,
            },
            last_tmax: UNAVAILABLE_TEMP,
            bias_level,
            sleeptime,
            tmp_sleeptime: sleeptime,
        }
    }

    /// Hand out the next `num` slots as a cursor
    pub(crate) fn slots(&mut self, num: usize) -> TempRef {
        let r = TempRef {
            start: self.refd_temps,
            len: num,
            pos: 0,
        };
        self.refd_temps += num;
        r
    }

    /// Total number of temperature slots
    pub(crate) fn len(&self) -> usize {
        self.temps.len()
    }

    /// Slots handed out so far
    pub(crate) fn refd_temps(&self) -> usize {
        self.refd_temps
    }

    /// Save the previous maximum and reset for a new round of readings
    pub(crate) fn start_cycle(&mut self) {
        self.last_tmax = self.tmax.value;
        self.tmax = Tmax {
            idx: 0,
            value: UNAVAILABLE_TEMP,
        };
        self.filled = 0;
    }

    /// Whether every slot received an add/skip since [`Self::start_cycle`]
    pub(crate) fn cycle_complete(&self) -> bool {
        self.filled == self.temps.len()
    }

    /// Record a reading at the cursor position and advance it
    ///
    /// A rise of more than 2 °C since the previous reading inflates the
    /// bias and floors the sleep time at 2 s; otherwise the sleep time
    /// creeps back toward its configured value and the bias decays.
    pub(crate) fn add_temp(&mut self, r: &mut TempRef, t: i32) {
        let Some(i) = r.advance() else {
            return;
        };

        let diff = if self.temps[i] > 0 {
            t - self.temps[i]
        } else {
            0
        };
        self.temps[i] = t;

        if diff > 2 {
            // Exaggerate if the temperature rose quickly; the bias starts
            // out in whole degrees, only the decay leaves fractions behind
            self.biases[i] = (diff as f32 * self.bias_level).trunc();
            if self.tmp_sleeptime > RUSH_SLEEPTIME {
                self.tmp_sleeptime = RUSH_SLEEPTIME;
            }
        } else {
            // Slowly return to the normal sleep time
            if self.tmp_sleeptime < self.sleeptime {
                self.tmp_sleeptime += Duration::from_secs(1);
            }
            let b = self.biases[i];
            #[expect(clippy::float_cmp)] // bias is set to 0.0 explicitly
            if b != 0.0 {
                self.biases[i] = if b.abs() < 0.5 {
                    0.0
                } else {
                    b - (1.0 + b.abs() / 5.0).copysign(b)
                };
            }
        }

        #[expect(clippy::cast_possible_truncation)] // truncation toward zero is the contract
        let biased = t + self.biases[i] as i32;
        self.biased_temps[i] = biased;

        if biased > self.tmax.value {
            self.tmax = Tmax { idx: i, value: biased };
        }
        self.filled += 1;
    }

    /// Keep the previous reading at the cursor position and advance it
    pub(crate) fn skip_temp(&mut self, r: &mut TempRef) {
        if r.advance().is_some() {
            self.filled += 1;
        }
    }

    /// Biased readings the level table is compared against
    pub(crate) fn biased_temps(&self) -> &[i32] {
        &self.biased_temps
    }

    /// Last raw (corrected) readings
    pub(crate) fn temps(&self) -> &[i32] {
        &self.temps
    }

    /// Current bias values
    #[cfg(test)]
    pub(crate) fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Hottest biased reading of the current cycle
    pub(crate) fn tmax(&self) -> Tmax {
        self.tmax
    }

    /// Hottest biased reading of the previous cycle
    pub(crate) fn last_tmax(&self) -> i32 {
        self.last_tmax
    }

    /// Current adaptive sleep time
    pub(crate) fn tmp_sleeptime(&self) -> Duration {
        self.tmp_sleeptime
    }

    /// Snap the adaptive sleep time back to its configured value
    pub(crate) fn reset_sleeptime(&mut self) {
        self.tmp_sleeptime = self.sleeptime;
    }

    /// One-line temperature report, as logged on SIGUSR1
    pub(crate) fn report(&self) -> String {
        format!(
            "Current temperatures: {}",
            self.temps
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use float_cmp::approx_eq;

    use super::*;

    /// Fresh state with one registered single-slot cursor
    fn state(bias_level: f32) -> (TempState, TempRef) {
        let mut ts = TempState::new(1, bias_level, Duration::from_secs(5));
        let r = ts.slots(1);
        (ts, r)
    }

    #[test]
    fn slots_are_disjoint() {
        let mut ts = TempState::new(5, 0.5, Duration::from_secs(5));
        let mut a = ts.slots(2);
        let mut b = ts.slots(3);
        assert_eq!(ts.refd_temps(), 5);
        ts.start_cycle();
        ts.add_temp(&mut a, 10);
        ts.add_temp(&mut a, 20);
        ts.add_temp(&mut b, 30);
        ts.add_temp(&mut b, 40);
        ts.add_temp(&mut b, 50);
        assert_eq!(ts.temps(), &[10, 20, 30, 40, 50]);
        assert!(ts.cycle_complete());
    }

    #[test]
    fn jump_inflates_bias_and_shortens_sleep() {
        let (mut ts, mut r) = state(0.5);
        ts.start_cycle();
        ts.add_temp(&mut r, 50);
        assert_eq!(ts.biased_temps(), &[50]);
        assert_eq!(ts.tmp_sleeptime(), Duration::from_secs(5));

        r.restart();
        ts.start_cycle();
        ts.add_temp(&mut r, 60);
        // diff 10 -> bias 5.0, biased 65, sleep floored at 2s
        assert!(approx_eq!(f32, ts.biases()[0], 5.0));
        assert_eq!(ts.biased_temps(), &[65]);
        assert_eq!(ts.tmax(), Tmax { idx: 0, value: 65 });
        assert_eq!(ts.tmp_sleeptime(), Duration::from_secs(2));
    }

    #[test]
    fn rise_bias_is_stored_in_whole_degrees() {
        let (mut ts, mut r) = state(0.5);
        ts.start_cycle();
        ts.add_temp(&mut r, 50);
        r.restart();
        ts.start_cycle();
        ts.add_temp(&mut r, 59);
        // diff 9 * 0.5 = 4.5, truncated at assignment
        assert!(approx_eq!(f32, ts.biases()[0], 4.0));
        assert_eq!(ts.biased_temps(), &[63]);
    }

    #[test]
    fn bias_decays_and_sleep_recovers() {
        let (mut ts, mut r) = state(0.5);
        ts.start_cycle();
        ts.add_temp(&mut r, 50);
        r.restart();
        ts.start_cycle();
        ts.add_temp(&mut r, 55); // diff 5: bias = trunc(2.5) = 2
        assert!(approx_eq!(f32, ts.biases()[0], 2.0));
        assert_eq!(ts.biased_temps(), &[57]);

        r.restart();
        ts.start_cycle();
        ts.add_temp(&mut r, 55); // decay: 2 - (1 + 2/5) = 0.6
        assert!(approx_eq!(f32, ts.biases()[0], 0.6, epsilon = 0.000_01));
        assert_eq!(ts.biased_temps(), &[55]);
        assert_eq!(ts.tmp_sleeptime(), Duration::from_secs(3));

        r.restart();
        ts.start_cycle();
        ts.add_temp(&mut r, 55); // decay overshoots zero: 0.6 - 1.12 = -0.52
        assert!(approx_eq!(f32, ts.biases()[0], -0.52, epsilon = 0.000_01));
        assert_eq!(ts.biased_temps(), &[55]);
        assert_eq!(ts.tmp_sleeptime(), Duration::from_secs(4));

        r.restart();
        ts.start_cycle();
        ts.add_temp(&mut r, 55);
        assert_eq!(ts.tmp_sleeptime(), Duration::from_secs(5));
    }

    #[test]
    fn first_reading_never_biases() {
        // temps start at 0, so the first reading must not count as a jump
        let (mut ts, mut r) = state(0.5);
        ts.start_cycle();
        ts.add_temp(&mut r, 90);
        assert!(approx_eq!(f32, ts.biases()[0], 0.0));
        assert_eq!(ts.biased_temps(), &[90]);
        assert_eq!(ts.tmp_sleeptime(), Duration::from_secs(5));
    }

    #[test]
    fn unavailable_slot_does_not_raise_tmax() {
        let mut ts = TempState::new(2, 0.5, Duration::from_secs(5));
        let mut a = ts.slots(1);
        let mut b = ts.slots(1);
        ts.start_cycle();
        ts.add_temp(&mut a, UNAVAILABLE_TEMP);
        ts.add_temp(&mut b, 40);
        assert_eq!(ts.tmax(), Tmax { idx: 1, value: 40 });
    }

    #[test]
    fn skipped_slot_keeps_previous_reading() {
        let (mut ts, mut r) = state(0.5);
        ts.start_cycle();
        ts.add_temp(&mut r, 47);
        r.restart();
        ts.start_cycle();
        ts.skip_temp(&mut r);
        assert_eq!(ts.temps(), &[47]);
        assert!(ts.cycle_complete());
    }

    #[test]
    fn overran_cursor_is_ignored() {
        let (mut ts, mut r) = state(0.5);
        ts.start_cycle();
        ts.add_temp(&mut r, 40);
        ts.add_temp(&mut r, 99);
        assert_eq!(ts.temps(), &[40]);
        assert_eq!(r.taken(), 1);
    }

    #[test]
    fn incomplete_cycle_is_detected() {
        let mut ts = TempState::new(2, 0.5, Duration::from_secs(5));
        let mut r = ts.slots(2);
        ts.start_cycle();
        ts.add_temp(&mut r, 40);
        assert!(!ts.cycle_complete());
    }

    #[test]
    fn report_lists_raw_temps() {
        let mut ts = TempState::new(2, 0.5, Duration::from_secs(5));
        let mut r = ts.slots(2);
        ts.start_cycle();
        ts.add_temp(&mut r, 41);
        ts.add_temp(&mut r, 52);
        assert_eq!(ts.report(), "Current temperatures: 41, 52");
    }
}
