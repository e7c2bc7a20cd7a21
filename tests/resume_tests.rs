//! An end-to-end run over a resume's association graph: a request resolves
//! every association of two resumes, then the achievements of the records
//! found on the first level. Each level should reach the store exactly once
//! per tag.

use std::{collections::HashMap, sync::Mutex};

use futures::{executor, future};
use tagloader::{
    window, BatchController, BatchRules, Cardinality, KeyedRecord, Loaded, TagRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ResumeTag {
    PersonalInfo,
    Education,
    Experience,
    Skill,
    Hobby,
    SpokenLanguage,
    SupplementarySkill,
    AchievementFromEducation,
    AchievementFromExperience,
    AchievementFromSkill,
}

use ResumeTag::*;

static TAGS: [(ResumeTag, Cardinality, &str); 10] = [
    (PersonalInfo, Cardinality::One, "resume_id"),
    (Education, Cardinality::Many, "resume_id"),
    (Experience, Cardinality::Many, "resume_id"),
    (Skill, Cardinality::Many, "resume_id"),
    (Hobby, Cardinality::Many, "owner_id"),
    (SpokenLanguage, Cardinality::Many, "owner_id"),
    (SupplementarySkill, Cardinality::Many, "owner_id"),
    (AchievementFromEducation, Cardinality::Many, "owner_id"),
    (AchievementFromExperience, Cardinality::Many, "owner_id"),
    (AchievementFromSkill, Cardinality::Many, "owner_id"),
];

static RESUME_LEVEL: [ResumeTag; 7] = [
    PersonalInfo,
    Education,
    Experience,
    Skill,
    Hobby,
    SpokenLanguage,
    SupplementarySkill,
];

#[derive(Debug, Clone, PartialEq)]
struct Record {
    id: String,
    resume_id: Option<String>,
    owner_id: Option<String>,
}

impl KeyedRecord<String> for Record {
    fn correlation_key(&self, attribute: &str) -> Option<String> {
        match attribute {
            "resume_id" => self.resume_id.clone(),
            "owner_id" => self.owner_id.clone(),
            _ => None,
        }
    }
}

fn of_resume(id: &str, resume_id: &str) -> Record {
    Record {
        id: id.to_string(),
        resume_id: Some(resume_id.to_string()),
        owner_id: None,
    }
}

fn owned_by(id: &str, owner_id: &str) -> Record {
    Record {
        id: id.to_string(),
        resume_id: None,
        owner_id: Some(owner_id.to_string()),
    }
}

/// An in-memory store with one table per tag, which logs every query made
/// against it.
struct Store {
    tables: HashMap<ResumeTag, Vec<Record>>,
    queries: Mutex<Vec<(ResumeTag, Vec<String>)>>,
}

impl Store {
    fn new() -> Self {
        let mut tables = HashMap::new();

        tables.insert(
            PersonalInfo,
            vec![of_resume("p1", "r1"), of_resume("p2", "r2")],
        );
        tables.insert(
            Education,
            vec![
                of_resume("e1", "r1"),
                of_resume("e3", "r2"),
                of_resume("e2", "r1"),
                // Broken row without a resume; never handed to anyone
                owned_by("e4", "r1"),
            ],
        );
        tables.insert(Experience, vec![of_resume("x1", "r1")]);
        tables.insert(Skill, vec![of_resume("s1", "r1"), of_resume("s2", "r2")]);
        tables.insert(Hobby, vec![owned_by("h1", "r1")]);
        tables.insert(SpokenLanguage, vec![owned_by("l1", "r2")]);
        tables.insert(
            AchievementFromEducation,
            vec![
                owned_by("a1", "e1"),
                owned_by("a2", "e1"),
                // Belongs to an education nobody asks about
                owned_by("a5", "e9"),
            ],
        );
        tables.insert(AchievementFromExperience, vec![owned_by("a3", "x1")]);
        tables.insert(AchievementFromSkill, vec![owned_by("a4", "s2")]);

        Store {
            tables,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// SELECT * FROM <tag> WHERE <attribute> IN (<keys>)
    fn select(&self, tag: ResumeTag, attribute: &str, keys: &[String]) -> Vec<Record> {
        self.queries.lock().unwrap().push((tag, keys.to_vec()));

        self.tables
            .get(&tag)
            .into_iter()
            .flatten()
            .filter(|record| match record.correlation_key(attribute) {
                Some(key) => keys.contains(&key),
                None => false,
            })
            .cloned()
            .collect()
    }

    fn queries(&self) -> Vec<(ResumeTag, Vec<String>)> {
        self.queries.lock().unwrap().clone()
    }
}

fn registry(store: &Store) -> TagRegistry<'_, ResumeTag, String, Record, String> {
    let mut registry = TagRegistry::new("resume_id");

    for &(tag, cardinality, attribute) in TAGS.iter() {
        registry
            .register(tag, cardinality, move |keys: Vec<String>| {
                future::ready(Ok(store.select(tag, attribute, &keys)))
            })
            .correlate_by(attribute);
    }

    registry
}

fn ids(loaded: &Loaded<Record>) -> Vec<&str> {
    match loaded {
        Loaded::One(record) => record.iter().map(|record| record.id.as_str()).collect(),
        Loaded::Many(records) => records.iter().map(|record| record.id.as_str()).collect(),
    }
}

fn strings(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|key| key.to_string()).collect()
}

#[test]
fn test_resume_graph_is_loaded_level_by_level() {
    let store = Store::new();

    let controller = BatchController::new(BatchRules {
        registry: registry(&store),
        window: window::manual,
        max_keys: None,
    });

    let resumes = ["r1", "r2"];

    // Level one: every association of every resume
    let lookups: Vec<(&str, ResumeTag)> = resumes
        .iter()
        .flat_map(|&resume| RESUME_LEVEL.iter().map(move |&tag| (resume, tag)))
        .collect();

    let futs = lookups
        .iter()
        .map(|&(resume, tag)| controller.load(tag, resume.to_string()).unwrap());
    let futs: Vec<_> = futs.collect();
    controller.flush();

    let level_one: HashMap<(&str, ResumeTag), Loaded<Record>> = lookups
        .iter()
        .cloned()
        .zip(executor::block_on(future::join_all(futs)))
        .map(|(lookup, result)| (lookup, result.unwrap()))
        .collect();

    assert_eq!(ids(&level_one[&("r1", PersonalInfo)]), ["p1"]);
    assert_eq!(ids(&level_one[&("r2", PersonalInfo)]), ["p2"]);
    assert_eq!(ids(&level_one[&("r1", Education)]), ["e1", "e2"]);
    assert_eq!(ids(&level_one[&("r2", Education)]), ["e3"]);
    assert_eq!(ids(&level_one[&("r1", Experience)]), ["x1"]);
    assert!(level_one[&("r2", Experience)].is_empty());
    assert_eq!(ids(&level_one[&("r1", Hobby)]), ["h1"]);
    assert!(level_one[&("r2", Hobby)].is_empty());
    assert_eq!(ids(&level_one[&("r2", SpokenLanguage)]), ["l1"]);
    assert!(level_one[&("r1", SupplementarySkill)].is_empty());

    // Level two: the achievements of everything found on level one
    let owners = [
        (Education, AchievementFromEducation),
        (Experience, AchievementFromExperience),
        (Skill, AchievementFromSkill),
    ];

    let mut lookups: Vec<(String, ResumeTag)> = Vec::new();
    for &(parent, tag) in owners.iter() {
        for &resume in resumes.iter() {
            for record in level_one[&(resume, parent)].clone().into_many().unwrap() {
                lookups.push((record.id.clone(), tag));
            }
        }
    }

    let futs: Vec<_> = lookups
        .iter()
        .map(|(owner, tag)| controller.load(*tag, owner.clone()).unwrap())
        .collect();
    controller.flush();

    let level_two: HashMap<(String, ResumeTag), Loaded<Record>> = lookups
        .into_iter()
        .zip(executor::block_on(future::join_all(futs)))
        .map(|(lookup, result)| (lookup, result.unwrap()))
        .collect();

    let achievements =
        |owner: &str, tag: ResumeTag| ids(&level_two[&(owner.to_string(), tag)]).join(",");

    assert_eq!(achievements("e1", AchievementFromEducation), "a1,a2");
    assert_eq!(achievements("e2", AchievementFromEducation), "");
    assert_eq!(achievements("e3", AchievementFromEducation), "");
    assert_eq!(achievements("x1", AchievementFromExperience), "a3");
    assert_eq!(achievements("s1", AchievementFromSkill), "");
    assert_eq!(achievements("s2", AchievementFromSkill), "a4");

    // One query per tag and level, with every key of that level
    let resume_keys = strings(&resumes);
    let mut expected: Vec<(ResumeTag, Vec<String>)> = RESUME_LEVEL
        .iter()
        .map(|&tag| (tag, resume_keys.clone()))
        .collect();
    expected.push((AchievementFromEducation, strings(&["e1", "e2", "e3"])));
    expected.push((AchievementFromExperience, strings(&["x1"])));
    expected.push((AchievementFromSkill, strings(&["s1", "s2"])));

    assert_eq!(store.queries(), expected);
    assert_eq!(controller.cached_keys(), 14 + 6);
}

#[test]
fn test_resolving_a_resume_twice_reuses_everything() {
    let store = Store::new();

    let controller = BatchController::new(BatchRules {
        registry: registry(&store),
        window: window::manual,
        max_keys: None,
    });

    let load_resume = |resume: &str| {
        let futs: Vec<_> = RESUME_LEVEL
            .iter()
            .map(|&tag| controller.load(tag, resume.to_string()).unwrap())
            .collect();
        controller.flush();

        executor::block_on(future::join_all(futs))
            .into_iter()
            .map(|result| result.unwrap())
            .collect::<Vec<_>>()
    };

    let first = load_resume("r1");
    let second = load_resume("r1");

    assert_eq!(first, second);
    assert_eq!(store.queries().len(), RESUME_LEVEL.len());
}
