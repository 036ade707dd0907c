//! Seeded synthetic people data for demos and tests.
//!
//! Set A is drawn from small name pools with random birth years and zip
//! codes, then deduplicated. Set B copies A and independently corrupts each
//! record: first-name typos, last-name typos, birth-year shifts of up to two
//! years. Ids are shared, so ground truth is `(i, i)` for every record.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};

use crate::model::RawRecord;

const FIRST_NAMES: [&str; 10] =
    ["John", "Jane", "Michael", "Emily", "David", "Sarah", "William", "Emma", "James", "Olivia"];
const LAST_NAMES: [&str; 10] = [
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez", "Martinez",
];
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Column order of the generated data.
pub const COLUMNS: [&str; 4] = ["firstname", "lastname", "birthyear", "zipcode"];

/// A ready-to-run configuration for the generated files.
pub const DEMO_CONFIG: &str = r#"name = "Synthetic people"

[sources.a]
file = "dataset_a.csv"

[sources.b]
file = "dataset_b.csv"

[[fields]]
name = "firstname"
type = "string"
metric = { kind = "jaro_winkler" }

[[fields]]
name = "lastname"
type = "string"
metric = { kind = "jaro_winkler" }

[[fields]]
name = "birthyear"
type = "numeric"
metric = { kind = "gauss", offset = 0.0, scale = 2.0 }

[[fields]]
name = "zipcode"
type = "categorical"
metric = { kind = "exact" }

[[blocking]]
name = "zip"
parts = [{ transform = "exact", field = "zipcode" }]
"#;

#[derive(Debug, Clone)]
pub struct SynthConfig {
    /// Rows drawn for set A before deduplication.
    pub rows: usize,
    pub seed: u64,
    /// Independent probability of each noise type per record.
    pub noise: f64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self { rows: 10_000, seed: 123, noise: 0.25 }
    }
}

#[derive(Debug, Clone)]
pub struct SynthData {
    pub a: Vec<RawRecord>,
    pub b: Vec<RawRecord>,
    pub truth: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Person {
    firstname: String,
    lastname: String,
    birthyear: i32,
    zipcode: u32,
}

impl Person {
    fn to_raw(&self, id: usize) -> RawRecord {
        RawRecord::new(
            id.to_string(),
            [
                ("firstname", self.firstname.clone()),
                ("lastname", self.lastname.clone()),
                ("birthyear", self.birthyear.to_string()),
                ("zipcode", self.zipcode.to_string()),
            ],
        )
    }
}

pub fn generate(config: &SynthConfig) -> SynthData {
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut seen = HashSet::with_capacity(config.rows);
    let mut people = Vec::with_capacity(config.rows);
    for _ in 0..config.rows {
        let person = Person {
            firstname: pick(&mut rng, &FIRST_NAMES),
            lastname: pick(&mut rng, &LAST_NAMES),
            birthyear: rng.gen_range(1970..=2000),
            zipcode: rng.gen_range(10_000..=20_000),
        };
        if seen.insert(person.clone()) {
            people.push(person);
        }
    }

    let noise = config.noise.clamp(0.0, 1.0);
    let noisy: Vec<Person> = people
        .iter()
        .map(|p| {
            let mut q = p.clone();
            let (first, last, year) = (rng.gen_bool(noise), rng.gen_bool(noise), rng.gen_bool(noise));
            if first {
                q.firstname = typo(&mut rng, &q.firstname);
            }
            if last {
                q.lastname = typo(&mut rng, &q.lastname);
            }
            if year {
                q.birthyear += rng.gen_range(-2..=2);
            }
            q
        })
        .collect();

    let a: Vec<RawRecord> = people.iter().enumerate().map(|(i, p)| p.to_raw(i + 1)).collect();
    let b: Vec<RawRecord> = noisy.iter().enumerate().map(|(i, p)| p.to_raw(i + 1)).collect();
    let truth = (1..=a.len()).map(|i| (i.to_string(), i.to_string())).collect();

    log::info!(
        "synthetic data: {} unique record(s) from {} draw(s), seed {}",
        a.len(),
        config.rows,
        config.seed
    );
    SynthData { a, b, truth }
}

fn pick(rng: &mut StdRng, pool: &[&str]) -> String {
    pool.choose(rng).copied().unwrap_or_default().to_string()
}

/// Replace between one and all characters, at distinct positions, with random lower-case letters.
fn typo(rng: &mut StdRng, s: &str) -> String {
    let mut chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    let count = rng.gen_range(1..=chars.len());
    for pos in index::sample(rng, chars.len(), count) {
        chars[pos] = ALPHABET[rng.gen_range(0..ALPHABET.len())] as char;
    }
    chars.into_iter().collect()
}
