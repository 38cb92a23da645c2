// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Property-based tests for persona assignment strategies.

use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};

use agentsim_core::{AssignmentStrategy, PersonaAxes, PersonaTemplate};
use agentsim_engine::PersonaGenerator;

fn records(k: usize) -> PersonaTemplate {
    PersonaTemplate::Records {
        id_column: "user_id".to_string(),
        rows: (1..=k)
            .map(|i| {
                let mut row = BTreeMap::new();
                row.insert("user_id".to_string(), i.to_string());
                row.insert("plan".to_string(), if i % 2 == 0 { "gold" } else { "basic" }.to_string());
                row
            })
            .collect(),
    }
}

fn assigned(template: &PersonaTemplate, strategy: AssignmentStrategy, n: usize, seed: u64) -> Vec<String> {
    PersonaGenerator::generate(template, strategy, n, Some(seed), Default::default())
        .expect("valid template")
        .map(|p| p.user_id)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn sequential_assigns_i_mod_k(k in 1..20usize, n in 0..100usize) {
        let ids = assigned(&records(k), AssignmentStrategy::Sequential, n, 0);
        prop_assert_eq!(ids.len(), n);
        for (i, id) in ids.iter().enumerate() {
            prop_assert_eq!(id, &(i % k + 1).to_string());
        }
    }

    #[test]
    fn round_robin_never_reuses_before_cycle_completes(
        k in 1..15usize,
        n in 1..120usize,
        seed in any::<u64>(),
    ) {
        let ids = assigned(&records(k), AssignmentStrategy::RoundRobin, n, seed);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            *counts.entry(id.clone()).or_insert(0) += 1;
            let assigned_so_far = i + 1;
            let floor = assigned_so_far / k;
            // Every record reaches floor before any exceeds floor + 1
            let max = counts.values().copied().max().unwrap_or(0);
            prop_assert!(max <= floor + 1, "record used {} times after {} dispatches", max, assigned_so_far);
            if assigned_so_far % k == 0 {
                prop_assert_eq!(counts.len(), k);
                prop_assert!(counts.values().all(|c| *c == floor));
            }
        }
    }

    #[test]
    fn random_is_reproducible_for_a_seed(k in 1..30usize, n in 0..60usize, seed in any::<u64>()) {
        let template = records(k);
        let first = assigned(&template, AssignmentStrategy::Random, n, seed);
        let second = assigned(&template, AssignmentStrategy::Random, n, seed);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn synthesized_personas_are_reproducible(n in 1..40usize, seed in any::<u64>()) {
        let template = PersonaTemplate::Axes(PersonaAxes::default());
        let a: Vec<_> = PersonaGenerator::generate(&template, AssignmentStrategy::Random, n, Some(seed), Default::default())
            .expect("valid template")
            .collect();
        let b: Vec<_> = PersonaGenerator::generate(&template, AssignmentStrategy::Random, n, Some(seed), Default::default())
            .expect("valid template")
            .collect();
        prop_assert_eq!(a, b);
    }
}
