use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::models::{Lesson, Payment, PaymentStatus, PREPAYMENT_METHOD};

/// One write the allocator wants applied to a lesson.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationAction {
    /// Mark the lesson paid from deposit funds: set status Paid,
    /// `paid_cents = amount_cents`, and upsert the prepayment-method
    /// payment row for the same amount.
    Assign { lesson_id: i64, amount_cents: i64 },
    /// Remove any automatic allocation: delete the prepayment-method
    /// payment row, zero `paid_cents`, and set the given status.
    Revert {
        lesson_id: i64,
        status: PaymentStatus,
    },
}

/// Outcome of a planning pass. `actions` contains only writes that change
/// persisted state, so an unchanged re-run plans nothing.
#[derive(Debug, Clone, Default)]
pub struct AllocationPlan {
    pub actions: Vec<AllocationAction>,
    /// Deposit cents consumed by allocations kept or created this pass.
    pub consumed_cents: i64,
    /// Total deposit balance the pass started from.
    pub available_cents: i64,
}

/// Plans deposit allocation for one student: a single greedy pass over the
/// lessons in ascending start order, consuming the available balance
/// first-come-first-served.
///
/// Rules per lesson, in order:
/// - Cancelled: any automatic allocation is reverted; the lesson keeps its
///   Cancelled status.
/// - A manual (non-prepayment) PAID payment takes the lesson out of
///   automatic allocation entirely.
/// - Zero-priced lessons never hold an allocation.
/// - Otherwise the lesson is paid in full from the remaining balance, or
///   not at all; a lesson the balance no longer covers is reverted to Due
///   (start in the past) or Unpaid.
///
/// Consumed cents never exceed the available balance, and no earlier
/// eligible lesson is skipped in favor of a later one.
pub fn plan_allocation(lessons: &[Lesson], payments: &[Payment], now: DateTime<Utc>) -> AllocationPlan {
    let available_cents: i64 = payments
        .iter()
        .filter(|p| p.is_deposit())
        .map(|p| p.amount_cents)
        .sum();

    let auto_by_lesson: HashMap<i64, &Payment> = payments
        .iter()
        .filter(|p| p.is_auto_allocation())
        .filter_map(|p| p.lesson_id.map(|id| (id, p)))
        .collect();
    let manually_paid: HashSet<i64> = payments
        .iter()
        .filter(|p| {
            p.lesson_id.is_some()
                && p.method != PREPAYMENT_METHOD
                && p.status == PaymentStatus::Paid
        })
        .filter_map(|p| p.lesson_id)
        .collect();

    let mut ordered: Vec<&Lesson> = lessons.iter().collect();
    ordered.sort_by_key(|l| (l.start_at, l.id));

    let mut plan = AllocationPlan {
        available_cents,
        ..Default::default()
    };
    let mut remaining = available_cents;

    for lesson in ordered {
        let auto = auto_by_lesson.get(&lesson.id).copied();

        if lesson.payment_status == PaymentStatus::Cancelled {
            if auto.is_some() || lesson.paid_cents != 0 {
                plan.actions.push(AllocationAction::Revert {
                    lesson_id: lesson.id,
                    status: PaymentStatus::Cancelled,
                });
            }
            continue;
        }

        if manually_paid.contains(&lesson.id) {
            continue;
        }

        let resting_status = if lesson.start_at <= now {
            PaymentStatus::Due
        } else {
            PaymentStatus::Unpaid
        };

        if lesson.price_cents <= 0 {
            if auto.is_some() || lesson.paid_cents != 0 || lesson.payment_status != resting_status {
                plan.actions.push(AllocationAction::Revert {
                    lesson_id: lesson.id,
                    status: resting_status,
                });
            }
            continue;
        }

        if remaining >= lesson.price_cents {
            remaining -= lesson.price_cents;
            plan.consumed_cents += lesson.price_cents;

            let satisfied = lesson.payment_status == PaymentStatus::Paid
                && lesson.paid_cents == lesson.price_cents
                && auto.map_or(false, |p| p.amount_cents == lesson.price_cents);
            if !satisfied {
                plan.actions.push(AllocationAction::Assign {
                    lesson_id: lesson.id,
                    amount_cents: lesson.price_cents,
                });
            }
        } else if auto.is_some()
            || lesson.paid_cents != 0
            || lesson.payment_status != resting_status
        {
            plan.actions.push(AllocationAction::Revert {
                lesson_id: lesson.id,
                status: resting_status,
            });
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn lesson(id: i64, offset_days: i64, price: i64) -> Lesson {
        let start = now() + Duration::days(offset_days);
        Lesson {
            id,
            student_id: 1,
            start_at: start,
            end_at: start + Duration::hours(1),
            price_cents: price,
            ..Default::default()
        }
    }

    fn deposit(amount: i64) -> Payment {
        Payment {
            id: 100 + amount,
            lesson_id: None,
            student_id: 1,
            amount_cents: amount,
            method: PREPAYMENT_METHOD.to_string(),
            status: PaymentStatus::Paid,
            paid_at: now(),
            created_at: now(),
        }
    }

    fn auto_payment(id: i64, lesson_id: i64, amount: i64) -> Payment {
        Payment {
            id,
            lesson_id: Some(lesson_id),
            student_id: 1,
            amount_cents: amount,
            method: PREPAYMENT_METHOD.to_string(),
            status: PaymentStatus::Paid,
            paid_at: now(),
            created_at: now(),
        }
    }

    fn paid(mut lesson: Lesson, amount: i64) -> Lesson {
        lesson.payment_status = PaymentStatus::Paid;
        lesson.paid_cents = amount;
        lesson
    }

    #[test]
    fn test_greedy_fifo_consumes_in_start_order() {
        // 3000 cents across 1000/1000/1500: the first two are covered, the
        // third is not (1000 < 1500).
        let lessons = vec![lesson(1, 1, 1000), lesson(2, 2, 1000), lesson(3, 3, 1500)];
        let payments = vec![deposit(3000)];

        let plan = plan_allocation(&lessons, &payments, now());
        assert_eq!(
            plan.actions,
            vec![
                AllocationAction::Assign { lesson_id: 1, amount_cents: 1000 },
                AllocationAction::Assign { lesson_id: 2, amount_cents: 1000 },
            ]
        );
        assert_eq!(plan.consumed_cents, 2000);
        assert_eq!(plan.available_cents, 3000);
    }

    #[test]
    fn test_top_up_covers_the_remaining_lesson() {
        // State after the first pass was applied, plus a fresh 1000 deposit.
        let lessons = vec![
            paid(lesson(1, 1, 1000), 1000),
            paid(lesson(2, 2, 1000), 1000),
            lesson(3, 3, 1500),
        ];
        let payments = vec![
            deposit(3000),
            deposit(1000),
            auto_payment(10, 1, 1000),
            auto_payment(11, 2, 1000),
        ];

        let plan = plan_allocation(&lessons, &payments, now());
        assert_eq!(
            plan.actions,
            vec![AllocationAction::Assign { lesson_id: 3, amount_cents: 1500 }]
        );
        assert_eq!(plan.consumed_cents, 3500);
    }

    #[test]
    fn test_unchanged_inputs_plan_nothing() {
        let lessons = vec![paid(lesson(1, 1, 1000), 1000), lesson(2, 2, 1500)];
        let payments = vec![deposit(1000), auto_payment(10, 1, 1000)];

        let plan = plan_allocation(&lessons, &payments, now());
        assert!(plan.actions.is_empty());
        assert_eq!(plan.consumed_cents, 1000);
    }

    #[test]
    fn test_shrunken_balance_reverts_later_lessons_first() {
        // Both lessons were allocated against a 2000 deposit that has since
        // been reduced to 1000: the earlier lesson keeps its allocation,
        // the later one is reverted.
        let lessons = vec![paid(lesson(1, 1, 1000), 1000), paid(lesson(2, 2, 1000), 1000)];
        let payments = vec![
            deposit(1000),
            auto_payment(10, 1, 1000),
            auto_payment(11, 2, 1000),
        ];

        let plan = plan_allocation(&lessons, &payments, now());
        assert_eq!(
            plan.actions,
            vec![AllocationAction::Revert {
                lesson_id: 2,
                status: PaymentStatus::Unpaid,
            }]
        );
        assert_eq!(plan.consumed_cents, 1000);
    }

    #[test]
    fn test_cancelled_lesson_always_reverted_keeping_status() {
        let mut cancelled = paid(lesson(1, 1, 1000), 1000);
        cancelled.payment_status = PaymentStatus::Cancelled;
        let lessons = vec![cancelled, lesson(2, 2, 1000)];
        let payments = vec![deposit(1000), auto_payment(10, 1, 1000)];

        let plan = plan_allocation(&lessons, &payments, now());
        // The freed funds flow to the next lesson in the same pass.
        assert_eq!(
            plan.actions,
            vec![
                AllocationAction::Revert {
                    lesson_id: 1,
                    status: PaymentStatus::Cancelled,
                },
                AllocationAction::Assign { lesson_id: 2, amount_cents: 1000 },
            ]
        );
    }

    #[test]
    fn test_manual_payment_excludes_lesson() {
        let lessons = vec![paid(lesson(1, 1, 1000), 1000), lesson(2, 2, 1000)];
        let manual = Payment {
            id: 50,
            lesson_id: Some(1),
            student_id: 1,
            amount_cents: 1000,
            method: "cash".to_string(),
            status: PaymentStatus::Paid,
            paid_at: now(),
            created_at: now(),
        };
        let payments = vec![deposit(1000), manual];

        let plan = plan_allocation(&lessons, &payments, now());
        // Lesson 1 is untouched; the full balance covers lesson 2.
        assert_eq!(
            plan.actions,
            vec![AllocationAction::Assign { lesson_id: 2, amount_cents: 1000 }]
        );
    }

    #[test]
    fn test_zero_priced_lesson_never_holds_allocation() {
        let lessons = vec![paid(lesson(1, 1, 0), 0)];
        let payments = vec![deposit(1000), auto_payment(10, 1, 0)];

        let plan = plan_allocation(&lessons, &payments, now());
        assert_eq!(
            plan.actions,
            vec![AllocationAction::Revert {
                lesson_id: 1,
                status: PaymentStatus::Unpaid,
            }]
        );
        assert_eq!(plan.consumed_cents, 0);
    }

    #[rstest]
    #[case(-1, Some(PaymentStatus::Due))]
    #[case(1, None)]
    fn test_uncovered_lesson_rests_by_start_time(
        #[case] offset_days: i64,
        #[case] expected: Option<PaymentStatus>,
    ) {
        // A past unpaid lesson flips to Due; a future one is already at its
        // resting status and needs no write.
        let lessons = vec![lesson(1, offset_days, 1000)];
        let plan = plan_allocation(&lessons, &[], now());
        match expected {
            Some(status) => assert_eq!(
                plan.actions,
                vec![AllocationAction::Revert { lesson_id: 1, status }]
            ),
            None => assert!(plan.actions.is_empty()),
        }
    }

    #[test]
    fn test_consumption_never_exceeds_balance() {
        let lessons = vec![
            lesson(1, 1, 700),
            lesson(2, 2, 700),
            lesson(3, 3, 700),
            lesson(4, 4, 700),
        ];
        let payments = vec![deposit(2000)];

        let plan = plan_allocation(&lessons, &payments, now());
        assert!(plan.consumed_cents <= plan.available_cents);
        assert_eq!(plan.consumed_cents, 1400);
    }
}
