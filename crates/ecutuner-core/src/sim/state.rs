//! Vehicle state and the per-tick physics step

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::vehicle::VehicleProfile;

/// Engine idle speed
pub const IDLE_RPM: f64 = 850.0;

/// Extra RPM the clutch lets the engine carry over idle at full throttle
const CLUTCH_SLIP_RPM: f64 = 1500.0;

const WHEEL_RADIUS_M: f64 = 0.31;

/// Aerodynamic drag coefficient, N per (m/s)^2
const AERO_DRAG: f64 = 0.38;

/// Braking force at full pedal, N
const BRAKE_FORCE_N: f64 = 12_000.0;

/// Drive force available while the clutch is still slipping at idle
const IDLE_CRAWL_FORCE_N: f64 = 600.0;

/// Engine-off spin-down, RPM per second
const RPM_DECAY_PER_S: f64 = 3000.0;

/// Per-tick coasting factor. Deliberately not scaled by dt.
const COAST_FACTOR: f64 = 0.99;

/// Velocities below this snap to zero when coasting
const STOP_THRESHOLD_M_S: f64 = 0.05;

/// First-order lag constant for free-revving RPM, 1/s
const FREE_REV_RATE: f64 = 4.0;

const AMBIENT_TEMP_C: f64 = 20.0;
const OPERATING_TEMP_C: f64 = 90.0;

/// Coolant warm-up rate, 1/s
const WARMUP_RATE: f64 = 0.02;

const CHARGING_VOLTS: f64 = 14.1;
const RESTING_VOLTS: f64 = 12.4;
const VOLTAGE_RIPPLE: f64 = 0.05;

/// Transmission selector position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GearSelector {
    Park,
    Neutral,
    Drive,
}

/// Gear part of a control input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GearCommand {
    /// Leave gear and selector alone
    #[default]
    Hold,
    /// Move the forward gear up or down by this many steps
    Shift(i8),
    /// Move the selector
    Select(GearSelector),
}

/// Ignition part of a control input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnitionCommand {
    #[default]
    Keep,
    Toggle,
    On,
    Off,
}

/// One set of driver inputs
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlInput {
    /// Pedal position, clamped to `[0, 1]`
    pub throttle: f64,
    /// Pedal position, clamped to `[0, 1]`
    pub brake: f64,
    pub gear: GearCommand,
    pub ignition: IgnitionCommand,
}

/// Mutable vehicle state owned by the simulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub throttle: f64,
    pub brake: f64,
    pub gear_selector: GearSelector,
    pub engine_on: bool,
    pub velocity_m_s: f64,
    pub rpm: f64,
    /// Forward gear engaged while in Drive
    pub current_gear: i8,
    pub coolant_temp: f64,
    pub battery_volts: f64,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            throttle: 0.0,
            brake: 0.0,
            gear_selector: GearSelector::Park,
            engine_on: false,
            velocity_m_s: 0.0,
            rpm: 0.0,
            current_gear: 1,
            coolant_temp: AMBIENT_TEMP_C,
            battery_volts: RESTING_VOLTS,
        }
    }
}

impl VehicleState {
    /// Vehicle speed in km/h
    pub fn speed_kmh(&self) -> f64 {
        self.velocity_m_s * 3.6
    }

    /// Apply driver inputs
    pub fn apply(&mut self, input: &ControlInput, profile: &VehicleProfile) {
        self.throttle = sanitize_pedal(input.throttle);
        self.brake = sanitize_pedal(input.brake);

        match input.gear {
            GearCommand::Hold => {}
            GearCommand::Shift(delta) => {
                let target = self.current_gear as i16 + delta as i16;
                self.current_gear = target.clamp(1, profile.top_gear() as i16) as i8;
            }
            GearCommand::Select(selector) => self.gear_selector = selector,
        }

        match input.ignition {
            IgnitionCommand::Keep => {}
            IgnitionCommand::Toggle => self.engine_on = !self.engine_on,
            IgnitionCommand::On => self.engine_on = true,
            IgnitionCommand::Off => self.engine_on = false,
        }
    }

    /// Advance the state by `dt` seconds
    pub fn step<R: Rng + ?Sized>(&mut self, profile: &VehicleProfile, dt: f64, rng: &mut R) {
        let dt = dt.max(0.0);

        if self.engine_on {
            self.battery_volts = CHARGING_VOLTS + rng.gen_range(-VOLTAGE_RIPPLE..=VOLTAGE_RIPPLE);
            self.coolant_temp += (OPERATING_TEMP_C - self.coolant_temp) * WARMUP_RATE * dt;
        } else {
            // Coolant is intentionally left where it is.
            self.battery_volts = RESTING_VOLTS;
        }

        if !self.engine_on {
            self.rpm = (self.rpm - RPM_DECAY_PER_S * dt).max(0.0);
            self.coast();
        } else {
            match self.gear_selector {
                GearSelector::Drive => self.step_drive(profile, dt),
                GearSelector::Neutral | GearSelector::Park => {
                    let target = IDLE_RPM + self.throttle * (profile.max_rpm - IDLE_RPM);
                    self.rpm += (target - self.rpm) * (FREE_REV_RATE * dt).min(1.0);
                    if self.gear_selector == GearSelector::Park {
                        self.velocity_m_s = 0.0;
                    } else {
                        self.coast();
                    }
                }
            }
        }

        self.rpm = self.rpm.clamp(0.0, profile.max_rpm);
    }

    fn step_drive(&mut self, profile: &VehicleProfile, dt: f64) {
        let ratio = profile.gear_ratio(self.current_gear) * profile.final_drive_ratio;
        let wheel_rpm = |v: f64| v / WHEEL_RADIUS_M * ratio * 60.0 / (2.0 * PI);

        let mut drive_force =
            self.throttle * profile.max_torque_nm * profile.torque_factor(self.rpm) * ratio
                / WHEEL_RADIUS_M;
        if wheel_rpm(self.velocity_m_s) < IDLE_RPM {
            drive_force = drive_force.max(IDLE_CRAWL_FORCE_N);
        }

        let drag = AERO_DRAG * self.velocity_m_s * self.velocity_m_s;
        let braking = self.brake * BRAKE_FORCE_N;
        let accel = (drive_force - drag - braking) / profile.mass_kg;

        self.velocity_m_s = (self.velocity_m_s + accel * dt).max(0.0);

        let floor = IDLE_RPM + self.throttle * CLUTCH_SLIP_RPM;
        self.rpm = floor.max(wheel_rpm(self.velocity_m_s));
    }

    fn coast(&mut self) {
        self.velocity_m_s *= COAST_FACTOR;
        if self.velocity_m_s < STOP_THRESHOLD_M_S {
            self.velocity_m_s = 0.0;
        }
    }
}

fn sanitize_pedal(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::VehicleSpecRegistry;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    const DT: f64 = 0.02;

    fn golf() -> Arc<VehicleProfile> {
        VehicleSpecRegistry::builtin().get("golf_gti").unwrap()
    }

    fn driving(throttle: f64, gear: i8) -> VehicleState {
        VehicleState {
            throttle,
            gear_selector: GearSelector::Drive,
            engine_on: true,
            current_gear: gear,
            rpm: IDLE_RPM,
            ..VehicleState::default()
        }
    }

    #[test]
    fn test_velocity_rises_toward_drag_equilibrium() {
        let profile = golf();
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = driving(0.3, 6);

        let mut previous = state.velocity_m_s;
        let mut strictly_rising = 0;
        for _ in 0..20_000 {
            state.step(&profile, DT, &mut rng);
            if state.velocity_m_s <= previous {
                break;
            }
            strictly_rising += 1;
            previous = state.velocity_m_s;
        }

        // Ran long enough to approach the balance point
        assert!(strictly_rising > 1000, "only {} rising ticks", strictly_rising);
        assert!(state.rpm < profile.max_rpm);
    }

    #[test]
    fn test_first_gear_full_throttle_keeps_accelerating() {
        let profile = golf();
        let mut rng = StdRng::seed_from_u64(11);
        let mut state = driving(1.0, 1);

        let mut previous = state.velocity_m_s;
        for tick in 0..3000 {
            state.step(&profile, DT, &mut rng);
            assert!(
                state.velocity_m_s > previous,
                "tick {}: velocity {} -> {} at rpm {}",
                tick,
                previous,
                state.velocity_m_s,
                state.rpm
            );
            assert!(state.rpm <= profile.max_rpm);
            previous = state.velocity_m_s;
        }
        // Long past the point where the engine pins at its limit
        assert_eq!(state.rpm, profile.max_rpm);
    }

    #[test]
    fn test_engine_off_decays_to_zero() {
        let profile = golf();
        let mut rng = StdRng::seed_from_u64(1);
        let mut state = VehicleState {
            engine_on: false,
            rpm: 6000.0,
            velocity_m_s: 40.0,
            gear_selector: GearSelector::Drive,
            ..VehicleState::default()
        };

        let mut rpm = state.rpm;
        let mut velocity = state.velocity_m_s;
        for _ in 0..1000 {
            state.step(&profile, DT, &mut rng);
            assert!(state.rpm <= rpm);
            assert!(state.velocity_m_s <= velocity);
            rpm = state.rpm;
            velocity = state.velocity_m_s;
        }
        assert_eq!(state.rpm, 0.0);
        assert_eq!(state.velocity_m_s, 0.0);
    }

    #[test]
    fn test_coast_factor_is_per_tick() {
        let profile = golf();
        let mut rng = StdRng::seed_from_u64(1);
        let mut a = VehicleState {
            velocity_m_s: 10.0,
            ..VehicleState::default()
        };
        let mut b = a.clone();

        a.step(&profile, 0.01, &mut rng);
        b.step(&profile, 0.1, &mut rng);
        assert_eq!(a.velocity_m_s, 10.0 * COAST_FACTOR);
        assert_eq!(a.velocity_m_s, b.velocity_m_s);
    }

    #[test]
    fn test_rpm_clamped_for_any_inputs() {
        let profile = golf();
        let mut rng = StdRng::seed_from_u64(42);
        let mut state = VehicleState::default();

        let selectors = [GearSelector::Park, GearSelector::Neutral, GearSelector::Drive];
        for i in 0..5000 {
            let input = ControlInput {
                throttle: rng.gen_range(-0.5..1.5),
                brake: if i % 7 == 0 { 1.0 } else { 0.0 },
                gear: match i % 50 {
                    0 => GearCommand::Shift(1),
                    25 => GearCommand::Shift(-1),
                    10 => GearCommand::Select(selectors[(i / 50) % 3]),
                    _ => GearCommand::Hold,
                },
                ignition: if i % 900 == 0 {
                    IgnitionCommand::Toggle
                } else {
                    IgnitionCommand::Keep
                },
            };
            state.apply(&input, &profile);
            state.step(&profile, rng.gen_range(0.0..0.1), &mut rng);

            assert!(state.rpm >= 0.0 && state.rpm <= profile.max_rpm, "rpm {}", state.rpm);
            assert!(state.velocity_m_s >= 0.0);
        }
    }

    #[test]
    fn test_park_holds_vehicle_and_revs_freely() {
        let profile = golf();
        let mut rng = StdRng::seed_from_u64(3);
        let mut state = VehicleState {
            engine_on: true,
            throttle: 1.0,
            velocity_m_s: 5.0,
            ..VehicleState::default()
        };

        state.step(&profile, DT, &mut rng);
        assert_eq!(state.velocity_m_s, 0.0);

        for _ in 0..500 {
            state.step(&profile, DT, &mut rng);
        }
        assert!((state.rpm - profile.max_rpm).abs() < 1.0, "rpm {}", state.rpm);
    }

    #[test]
    fn test_idle_floor_at_standstill() {
        let profile = golf();
        let mut rng = StdRng::seed_from_u64(5);
        let mut state = driving(0.0, 1);
        state.brake = 1.0;

        for _ in 0..50 {
            state.step(&profile, DT, &mut rng);
        }
        assert_eq!(state.velocity_m_s, 0.0);
        assert_eq!(state.rpm, IDLE_RPM);
    }

    #[test]
    fn test_thermal_asymmetry() {
        let profile = golf();
        let mut rng = StdRng::seed_from_u64(9);
        let mut state = VehicleState {
            engine_on: true,
            ..VehicleState::default()
        };

        for _ in 0..1000 {
            state.step(&profile, DT, &mut rng);
        }
        let warm = state.coolant_temp;
        assert!(warm > AMBIENT_TEMP_C && warm < OPERATING_TEMP_C);
        assert!((state.battery_volts - CHARGING_VOLTS).abs() <= VOLTAGE_RIPPLE + 1e-9);

        state.engine_on = false;
        for _ in 0..1000 {
            state.step(&profile, DT, &mut rng);
        }
        assert_eq!(state.coolant_temp, warm);
        assert_eq!(state.battery_volts, RESTING_VOLTS);
    }

    #[test]
    fn test_shift_clamps_to_forward_gears() {
        let profile = golf();
        let mut state = VehicleState::default();

        state.apply(
            &ControlInput {
                gear: GearCommand::Shift(-3),
                ..ControlInput::default()
            },
            &profile,
        );
        assert_eq!(state.current_gear, 1);

        state.apply(
            &ControlInput {
                gear: GearCommand::Shift(10),
                ..ControlInput::default()
            },
            &profile,
        );
        assert_eq!(state.current_gear, 6);
    }
}
