#[cfg(test)]
mod proptest_codec {
    use crate::codec::*;
    use crate::engine::{Dispatcher, ScheduleEngine};
    use crate::error::RigError;
    use crate::motor::Direction;
    use crate::motor_controller::MotorId;
    use crate::schedule::{Action, DeviceId, Schedule, ScheduleBlock};
    use crate::units::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CountingDispatcher {
        counts: HashMap<String, usize>,
    }

    impl Dispatcher for CountingDispatcher {
        fn dispatch(&mut self, block: &ScheduleBlock) -> Result<(), RigError> {
            *self.counts.entry(block.id().to_string()).or_default() += 1;
            Ok(())
        }

        fn stop_all_motors(&mut self) -> Result<(), RigError> {
            Ok(())
        }
    }

    fn motor() -> impl Strategy<Value = MotorId> {
        prop::sample::select(MotorId::ALL.to_vec())
    }

    fn block() -> impl Strategy<Value = ScheduleBlock> {
        (motor(), 0u32..120, 1u32..30, 1u16..=8000).prop_map(|(m, start, duration, speed)| {
            ScheduleBlock::new(
                DeviceId::Motor(m),
                start,
                duration,
                Action::Move {
                    direction: Direction::Positive,
                    speed,
                },
            )
            .unwrap()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(2000))]

        // Every finite float survives the two-register split bit for bit
        #[test]
        fn float_split_is_lossless(value in any::<f32>().prop_filter("finite", |v| v.is_finite())) {
            let back = decode_f32_be(encode_f32_be(value));
            prop_assert_eq!(back.to_bits(), value.to_bits());
        }

        #[test]
        fn command_word_split_is_lossless(hi in any::<u8>(), lo in any::<u8>()) {
            prop_assert_eq!(decode_cmd(encode_cmd(hi, lo)), (hi, lo));
        }

        // Whole pulse counts convert to millimetres and back unchanged
        #[test]
        fn pulse_mm_round_trip(pulses in -1_000_000i64..1_000_000) {
            prop_assert_eq!(mm_to_pulse(pulse_to_mm(pulses)), pulses);
        }

        #[test]
        fn pulse_degree_round_trip(pulses in -100_000i64..100_000) {
            prop_assert_eq!(degree_to_pulse(pulse_to_degree(pulses)), pulses);
        }

        // Whatever gets accepted, no two blocks on one device overlap
        #[test]
        fn accepted_blocks_never_overlap(blocks in prop::collection::vec(block(), 0..40)) {
            let mut schedule = Schedule::new();
            for b in blocks {
                let _ = schedule.insert(b);
            }
            let accepted = schedule.blocks();
            for (i, a) in accepted.iter().enumerate() {
                for b in &accepted[i + 1..] {
                    prop_assert!(!a.overlaps(b), "{:?} overlaps {:?}", a.id(), b.id());
                }
            }
            for pair in accepted.windows(2) {
                prop_assert!((pair[0].start(), pair[0].device()) <= (pair[1].start(), pair[1].device()));
            }
        }

        // A full run dispatches each block exactly once
        #[test]
        fn each_block_dispatches_once(blocks in prop::collection::vec(block(), 1..20)) {
            let mut engine = ScheduleEngine::new();
            for b in blocks {
                let _ = engine.insert(b);
            }
            let horizon = engine.schedule().end_time() + 2;
            let mut dispatcher = CountingDispatcher::default();
            engine.start();
            for _ in 0..horizon {
                engine.tick(&mut dispatcher);
            }
            prop_assert_eq!(dispatcher.counts.len(), engine.blocks().len());
            prop_assert!(dispatcher.counts.values().all(|c| *c == 1));
        }
    }
}
