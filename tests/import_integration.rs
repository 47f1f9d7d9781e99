use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use entity_import::commands::import::{execute, ImportRequest, Outcome};
use entity_import::config::{Config, ReactorConfig};
use entity_import::feed;
use entity_import::importers::{self, ImportOptions};
use entity_import::logging::Verbosity;
use entity_import::model::{EntityType, RecoverStrategy, Verb};
use entity_import::remote::memory::MemoryApi;
use entity_import::remote::{ApiError, RemoteApi};
use entity_import::store::codec::{FieldValue, Tuple};
use entity_import::store::lock::DataDirLock;
use entity_import::store::mapping::MappingStore;
use entity_import::store::schema::MappingName;
use serde_json::json;
use tempfile::{tempdir, TempDir};

struct Site {
    dir: TempDir,
    config: Config,
    api: Arc<MemoryApi>,
}

impl Site {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let config = Config {
            data_dir: Some(dir.path().join("data")),
            logfile: Some(dir.path().join("import.log")),
            reactor: ReactorConfig {
                initial_ms: 10,
                step_ms: 10,
                max_ms: 50,
            },
            ..Config::default()
        };
        Self {
            dir,
            config,
            api: Arc::new(MemoryApi::starting_at(101)),
        }
    }

    fn csv(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn run(&self, entity: &str, csv: &Path, delete: bool, options: ImportOptions) -> Outcome {
        let info = importers::lookup(entity).unwrap();
        let rows = feed::read(csv, info.columns).unwrap();
        let request = ImportRequest {
            entity: entity.to_string(),
            csv_file: csv.to_path_buf(),
            delete,
            verbosity: Verbosity {
                quiet: true,
                ..Verbosity::default()
            },
            options,
        };
        let api: Arc<dyn RemoteApi> = self.api.clone();
        execute(&self.config, info, api, &rows, &request).unwrap()
    }

    fn import(&self, entity: &str, csv: &Path) -> Outcome {
        self.run(entity, csv, false, ImportOptions::default())
    }

    fn mapping(&self, name: MappingName) -> Vec<(Tuple, Tuple)> {
        let store = MappingStore::load(&self.config.data_dir(), &[name]).unwrap();
        let mut entries: Vec<_> = store
            .mapping(name)
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort();
        entries
    }
}

fn names(api: &MemoryApi, kind: EntityType) -> Vec<String> {
    let mut names: Vec<String> = api
        .entities(kind)
        .iter()
        .filter_map(|e| e.label().map(str::to_string))
        .collect();
    names.sort();
    names
}

const ORGS: &str = "organization_id,organization\n5,east\n6,west\n";

#[test]
fn organizations_are_created_once() {
    let site = Site::new();
    let csv = site.csv("orgs.csv", ORGS);

    let first = site.import("organization", &csv);
    first.result.unwrap();
    assert_eq!(first.summary.count(Verb::Created, MappingName::Organizations), 2);
    assert_eq!(
        site.mapping(MappingName::Organizations),
        vec![
            (Tuple::single(5), Tuple::single(101)),
            (Tuple::single(6), Tuple::single(102)),
        ]
    );

    let second = site.import("organization", &csv);
    second.result.unwrap();
    assert_eq!(second.summary.count(Verb::Found, MappingName::Organizations), 2);
    assert_eq!(second.summary.count(Verb::Created, MappingName::Organizations), 0);
    assert!(second.summary.is_idle());
    assert_eq!(site.api.calls("create"), 2);
}

#[test]
fn name_conflicts_are_renamed_with_the_source_key() {
    let site = Site::new();
    site.api
        .seed(EntityType::Organizations, json!({"name": "east"}));
    let csv = site.csv("orgs.csv", "organization_id,organization\n5,east\n");

    site.import("organization", &csv).result.unwrap();
    assert_eq!(names(&site.api, EntityType::Organizations), vec!["5-east", "east"]);
}

#[test]
fn malformed_row_is_counted_failed_and_the_rest_imports() {
    let site = Site::new();
    let csv = site.csv("orgs.csv", "organization_id,organization\nabc,bad\n6,west\n");

    let outcome = site.import("organization", &csv);
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Failed, MappingName::Organizations), 1);
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::Organizations), 1);
    assert_eq!(
        site.mapping(MappingName::Organizations),
        vec![(Tuple::single(6), Tuple::single(101))]
    );
    assert_eq!(names(&site.api, EntityType::Organizations), vec!["west"]);
}

#[test]
fn rejected_create_fails_one_row_only() {
    let site = Site::new();
    site.api.fail_next(
        "create",
        ApiError::Rejected {
            status: 422,
            body: "label is invalid".into(),
        },
    );

    let outcome = site.import("organization", &site.csv("orgs.csv", ORGS));
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Failed, MappingName::Organizations), 1);
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::Organizations), 1);
    assert_eq!(
        site.mapping(MappingName::Organizations),
        vec![(Tuple::single(6), Tuple::single(101))]
    );

    let retry = site.import("organization", &site.csv("orgs.csv", ORGS));
    retry.result.unwrap();
    assert_eq!(retry.summary.count(Verb::Created, MappingName::Organizations), 1);
    assert_eq!(retry.summary.count(Verb::Found, MappingName::Organizations), 1);
}

#[test]
fn unrecovered_conflict_fails_its_row_and_the_run_goes_on() {
    let mut site = Site::new();
    site.config.recover = RecoverStrategy::Fail;
    site.api
        .seed(EntityType::Organizations, json!({"name": "east"}));

    let outcome = site.import("organization", &site.csv("orgs.csv", ORGS));
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Failed, MappingName::Organizations), 1);
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::Organizations), 1);
    assert_eq!(
        site.mapping(MappingName::Organizations),
        vec![(Tuple::single(6), Tuple::single(102))]
    );
    assert_eq!(names(&site.api, EntityType::Organizations), vec!["east", "west"]);
}

#[test]
fn map_strategy_adopts_the_existing_organization() {
    let mut site = Site::new();
    site.config.recover = RecoverStrategy::Map;
    let existing = site
        .api
        .seed(EntityType::Organizations, json!({"name": "east"}));
    let csv = site.csv("orgs.csv", "organization_id,organization\n5,east\n");

    let outcome = site.import("organization", &csv);
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Mapped, MappingName::Organizations), 1);
    let id = existing.id().and_then(|v| v.as_i64()).unwrap();
    assert_eq!(
        site.mapping(MappingName::Organizations),
        vec![(Tuple::single(5), Tuple::single(id))]
    );
    assert_eq!(site.api.count(EntityType::Organizations), 1);
}

#[test]
fn into_org_id_maps_every_organization_onto_one() {
    let site = Site::new();
    site.api
        .seed(EntityType::Organizations, json!({"name": "Default"}));
    let csv = site.csv("orgs.csv", ORGS);

    let outcome = site.run(
        "organization",
        &csv,
        false,
        ImportOptions {
            into_org_id: Some(101),
            ..ImportOptions::default()
        },
    );
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Mapped, MappingName::Organizations), 2);
    assert_eq!(site.api.calls("create"), 0);
    let values: Vec<Tuple> = site
        .mapping(MappingName::Organizations)
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    assert_eq!(values, vec![Tuple::single(101), Tuple::single(101)]);
}

#[test]
fn deleting_keeps_the_last_organization() {
    let site = Site::new();
    let csv = site.csv("orgs.csv", ORGS);
    site.import("organization", &csv).result.unwrap();

    let deleted = site.run("organization", &csv, true, ImportOptions::default());
    deleted.result.unwrap();
    // The first row destroys its organization, the second is then the last
    // one and only loses its mapping.
    assert_eq!(deleted.summary.count(Verb::Deleted, MappingName::Organizations), 1);
    assert_eq!(site.api.count(EntityType::Organizations), 1);
    assert!(site.mapping(MappingName::Organizations).is_empty());
}

#[test]
fn mappings_to_vanished_entities_are_dropped_on_load() {
    let site = Site::new();
    let csv = site.csv("orgs.csv", ORGS);
    site.import("organization", &csv).result.unwrap();
    site.api
        .destroy(EntityType::Organizations, &FieldValue::Int(102))
        .unwrap();

    let outcome = site.import("organization", &csv);
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Found, MappingName::Organizations), 1);
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::Organizations), 1);
    assert_eq!(
        site.mapping(MappingName::Organizations),
        vec![
            (Tuple::single(5), Tuple::single(101)),
            (Tuple::single(6), Tuple::single(103)),
        ]
    );
}

const USERS: &str = "organization_id,user_id,username,last_name,first_name,email\n\
5,1,admin,Admin,Sat,admin@example.com\n\
5,2,jdoe,Doe,John,jdoe@example.com\n\
9,3,ghost,Ghost,Nobody,ghost@example.com\n";

#[test]
fn users_get_generated_passwords_and_missing_orgs_are_skipped() {
    let site = Site::new();
    site.import("organization", &site.csv("orgs.csv", ORGS))
        .result
        .unwrap();
    let passwords = site.dir.path().join("passwords.csv");

    let outcome = site.run(
        "user",
        &site.csv("users.csv", USERS),
        false,
        ImportOptions {
            new_passwords: Some(passwords.clone()),
            ..ImportOptions::default()
        },
    );
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::Users), 2);
    assert_eq!(outcome.summary.count(Verb::Skipped, MappingName::Users), 1);
    assert_eq!(names(&site.api, EntityType::Users), vec!["jdoe", "sat5_admin"]);

    let written = fs::read_to_string(&passwords).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines[0], "mail,login,password");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("admin@example.com,sat5_admin,sat5_admin_"));
    assert!(lines[2].starts_with("jdoe@example.com,jdoe,jdoe_"));

    let user = site
        .api
        .entities(EntityType::Users)
        .into_iter()
        .find(|u| u.str_attr("login") == Some("jdoe"))
        .unwrap();
    assert_eq!(user.get("organization_ids"), Some(&json!([101])));
    assert_eq!(user.get("admin"), Some(&json!(false)));
}

#[test]
fn merge_users_maps_existing_logins() {
    let site = Site::new();
    site.import("organization", &site.csv("orgs.csv", ORGS))
        .result
        .unwrap();
    site.api.seed(EntityType::Users, json!({"login": "jdoe"}));

    let outcome = site.run(
        "user",
        &site.csv("users.csv", USERS),
        false,
        ImportOptions {
            merge_users: true,
            ..ImportOptions::default()
        },
    );
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Mapped, MappingName::Users), 1);
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::Users), 1);
    assert_eq!(site.api.count(EntityType::Users), 2);
}

#[test]
fn host_collections_need_their_organization() {
    let site = Site::new();
    site.import("organization", &site.csv("orgs.csv", ORGS))
        .result
        .unwrap();
    let csv = site.csv(
        "groups.csv",
        "group_id,name,org_id\n30,web,5\n31,db,6\n32,lost,7\n",
    );

    let outcome = site.import("host-collection", &csv);
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::HostCollections), 2);
    assert_eq!(outcome.summary.count(Verb::Skipped, MappingName::HostCollections), 1);

    let deleted = site.run("host-collection", &csv, true, ImportOptions::default());
    deleted.result.unwrap();
    assert_eq!(deleted.summary.count(Verb::Deleted, MappingName::HostCollections), 2);
    assert_eq!(site.api.count(EntityType::HostCollections), 0);
}

const REPOS: &str = "id,org_id,repo_label,source_url,repo_type\n\
10,5,base,http://mirror.example.com/base,yum\n\
11,5,updates,http://cdn.example.com/updates,yum\n\
12,5,broken,not a url,yum\n";

#[test]
fn repositories_share_a_product_until_the_last_one_goes() {
    let site = Site::new();
    site.import("organization", &site.csv("orgs.csv", ORGS))
        .result
        .unwrap();
    let csv = site.csv("repos.csv", REPOS);

    let outcome = site.import("repository", &csv);
    outcome.result.unwrap();
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::Repositories), 2);
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::Products), 1);
    assert_eq!(outcome.summary.count(Verb::Found, MappingName::Products), 1);
    assert_eq!(outcome.summary.count(Verb::Skipped, MappingName::Repositories), 1);
    assert_eq!(names(&site.api, EntityType::Products), vec!["EXAMPLE.COM"]);
    assert_eq!(
        site.mapping(MappingName::Products)[0].0,
        Tuple::from((5, "EXAMPLE.COM"))
    );

    let only_base = site.csv(
        "base.csv",
        "id,org_id,repo_label,source_url,repo_type\n\
         10,5,base,http://mirror.example.com/base,yum\n",
    );
    site.run("repository", &only_base, true, ImportOptions::default())
        .result
        .unwrap();
    assert_eq!(site.api.count(EntityType::Repositories), 1);
    assert_eq!(site.api.count(EntityType::Products), 1);

    let deleted = site.run("repository", &csv, true, ImportOptions::default());
    deleted.result.unwrap();
    assert_eq!(deleted.summary.count(Verb::Deleted, MappingName::Repositories), 1);
    assert_eq!(deleted.summary.count(Verb::Deleted, MappingName::Products), 1);
    assert_eq!(site.api.count(EntityType::Repositories), 0);
    assert_eq!(site.api.count(EntityType::Products), 0);
    assert!(site.mapping(MappingName::Products).is_empty());
}

/// Finish every remote job shortly after it starts, until stopped.
fn job_runner(api: Arc<MemoryApi>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(20));
            for job in api.job_ids() {
                api.finish_job(&job);
            }
        }
    })
}

#[test]
fn synchronize_and_wait_runs_the_continuation_before_exit() {
    let site = Site::new();
    site.import("organization", &site.csv("orgs.csv", ORGS))
        .result
        .unwrap();
    let csv = site.csv(
        "repos.csv",
        "id,org_id,repo_label,source_url,repo_type\n10,5,base,http://mirror.example.com/base,yum\n",
    );

    let stop = Arc::new(AtomicBool::new(false));
    let runner = job_runner(site.api.clone(), stop.clone());
    let outcome = site.run(
        "repository",
        &csv,
        false,
        ImportOptions {
            synchronize: true,
            wait: true,
            ..ImportOptions::default()
        },
    );
    stop.store(true, Ordering::SeqCst);
    runner.join().unwrap();

    outcome.result.unwrap();
    assert_eq!(site.api.calls("start_job"), 1);
    // One show to check the sync state, one from the continuation.
    assert_eq!(site.api.calls("show"), 2);
    let repo = &site.api.entities(EntityType::Repositories)[0];
    assert_eq!(repo.str_attr("sync_state"), Some("finished"));

    // Already synchronized: no second job.
    site.run(
        "repository",
        &csv,
        false,
        ImportOptions {
            synchronize: true,
            ..ImportOptions::default()
        },
    )
    .result
    .unwrap();
    assert_eq!(site.api.calls("start_job"), 1);
}

#[test]
fn reactor_failure_still_saves_mappings() {
    let site = Site::new();
    site.import("organization", &site.csv("orgs.csv", ORGS))
        .result
        .unwrap();
    site.api.fail_status_queries("task service down");
    let csv = site.csv(
        "repos.csv",
        "id,org_id,repo_label,source_url,repo_type\n10,5,base,http://mirror.example.com/base,yum\n",
    );

    let outcome = site.run(
        "repository",
        &csv,
        false,
        ImportOptions {
            synchronize: true,
            wait: true,
            ..ImportOptions::default()
        },
    );
    let err = outcome.result.unwrap_err();
    assert_eq!(err.code(), "reactor_error");
    assert_eq!(outcome.summary.count(Verb::Created, MappingName::Repositories), 1);
    assert_eq!(site.mapping(MappingName::Repositories).len(), 1);
    DataDirLock::acquire(&site.config.data_dir()).unwrap();
}
