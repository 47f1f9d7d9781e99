use serde_json::{json, Map};
use tracing::info;

use crate::error::{ImportError, Result};
use crate::feed::{self, Row};
use crate::importers::{ImportOptions, Importer, ImporterInfo, RunContext};
use crate::model::{EntityType, Verb};
use crate::store::cache::entity_id;
use crate::store::codec::Tuple;
use crate::store::schema::MappingName;

pub const INFO: ImporterInfo = ImporterInfo {
    name: "user",
    description: "Import users",
    columns: &[
        "organization_id",
        "user_id",
        "username",
        "last_name",
        "first_name",
        "email",
    ],
    mappings: &[MappingName::Organizations, MappingName::Users],
    primary: MappingName::Users,
    build,
};

const PASSWORD_SUFFIX_LEN: usize = 8;
const PASSWORDS_HEADER: [&str; 3] = ["mail", "login", "password"];

fn build(_options: &ImportOptions) -> Box<dyn Importer> {
    Box::new(UserImporter::default())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NewPassword {
    mail: String,
    login: String,
    password: String,
}

#[derive(Debug, Default)]
pub struct UserImporter {
    new_passwords: Vec<NewPassword>,
}

/// The source system's `admin` clashes with the target's built-in account.
pub fn login_for(username: &str) -> String {
    if username == "admin" {
        "sat5_admin".to_string()
    } else {
        username.to_string()
    }
}

/// `<login>_` followed by eight random lowercase letters.
pub fn generate_password(login: &str) -> Result<String> {
    generate_password_with(login, |bytes| {
        getrandom::fill(bytes).map_err(|e| ImportError::Io(std::io::Error::other(e.to_string())))
    })
}

fn generate_password_with<F>(login: &str, mut fill_random: F) -> Result<String>
where
    F: FnMut(&mut [u8]) -> Result<()>,
{
    let mut bytes = [0_u8; PASSWORD_SUFFIX_LEN];
    fill_random(&mut bytes)?;
    let suffix: String = bytes.iter().map(|b| char::from(b'a' + b % 26)).collect();
    Ok(format!("{login}_{suffix}"))
}

impl Importer for UserImporter {
    fn import_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()> {
        let user_id = row.int("user_id")?;
        let source = Tuple::single(user_id);
        let login = login_for(row.get("username")?);
        let mut engine = ctx.engine();

        if engine.mappings().get(MappingName::Users, &source).is_some() {
            info!("user {login} already imported");
            engine.report(Verb::Found, MappingName::Users);
            return Ok(());
        }

        let org_id = engine.translate(
            MappingName::Organizations,
            &Tuple::single(row.int("organization_id")?),
        )?;

        if ctx.options.merge_users {
            engine.ensure_cached(EntityType::Users)?;
            let existing = engine
                .cache()
                .find_by(EntityType::Users, "login", &json!(login))
                .map(|user| entity_id(EntityType::Users, user))
                .transpose()?;
            if let Some(id) = existing {
                info!("user with login {login} already exists, associating");
                engine.map_entity(MappingName::Users, source, id)?;
                return Ok(());
            }
        }

        let password = generate_password(&login)?;
        let mail = row.get("email")?.to_string();
        let mut attrs = Map::new();
        attrs.insert("login".into(), json!(login));
        attrs.insert("firstname".into(), json!(row.get("first_name")?));
        attrs.insert("lastname".into(), json!(row.get("last_name")?));
        attrs.insert("mail".into(), json!(mail));
        attrs.insert("auth_source_id".into(), json!(1));
        attrs.insert("password".into(), json!(password));
        attrs.insert("organization_ids".into(), json!([org_id.to_json()]));
        attrs.insert("location_ids".into(), json!([]));
        attrs.insert("admin".into(), json!(false));

        let created = engine.create_entity(MappingName::Users, attrs, source)?;
        self.new_passwords.push(NewPassword {
            mail,
            login: created.str_attr("login").unwrap_or(&login).to_string(),
            password,
        });
        Ok(())
    }

    fn delete_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()> {
        let source = Tuple::single(row.int("user_id")?);
        ctx.engine().delete_entity(MappingName::Users, &source)
    }

    fn post_import(&mut self, ctx: &RunContext) -> Result<()> {
        let Some(path) = &ctx.options.new_passwords else {
            return Ok(());
        };
        if self.new_passwords.is_empty() {
            return Ok(());
        }
        let rows: Vec<Vec<String>> = self
            .new_passwords
            .iter()
            .map(|p| vec![p.mail.clone(), p.login.clone(), p.password.clone()])
            .collect();
        feed::write(path, &PASSWORDS_HEADER, &rows)?;
        info!(
            "wrote {} new passwords to {}",
            rows.len(),
            path.display()
        );
        Ok(())
    }
}
