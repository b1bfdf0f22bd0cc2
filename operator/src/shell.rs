//! `mysqlsh`-backed implementation of the admin client seam.
//!
//! Each operation spawns the shell in Python mode against the target
//! instance. Arguments travel through an environment variable (never argv),
//! results come back as a single marked JSON line on stdout, and AdminAPI
//! errors surface as `{"error": {code, message}}` objects mapped onto the
//! typed error contract.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use common_lib::mysql::{
    AddInstanceOptions, AdminClient, AdminError, ConnectOptions, CreateClusterOptions, DbaSession,
    GroupCluster, GtidSet, GtidState, InstanceInfo, MembershipProbe, RemoveInstanceOptions,
    RouterAccountOptions,
};

/// Marker prefixing the one JSON result line in the shell's output.
const RESULT_MARKER: &str = "<<<IDC>>>";
/// Environment variable carrying the operation arguments into the snippet.
const ARGS_ENV: &str = "MYSQLSH_OPERATOR_ARGS";

/// Spawns `mysqlsh` per admin operation.
#[derive(Debug, Clone)]
pub struct MysqlShell {
    program: String,
}

impl MysqlShell {
    /// Return a new `Self` driving the given `mysqlsh` binary.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

#[async_trait]
impl AdminClient for MysqlShell {
    async fn connect_dba(&self, target: &ConnectOptions) -> Result<Box<dyn DbaSession>, AdminError> {
        let session = ShellSession {
            program: self.program.clone(),
            target: target.clone(),
        };
        // The shell is spawned per call, so connecting only validates that
        // the target accepts an admin session at all.
        session
            .run("emit(session.run_sql('select 1').fetch_one()[0])", json!({}))
            .await?;
        Ok(Box::new(session))
    }
}

struct ShellSession {
    program: String,
    target: ConnectOptions,
}

impl ShellSession {
    fn uri(&self) -> String {
        format!(
            "{}@{}:{}",
            self.target.user, self.target.host, self.target.port
        )
    }

    async fn run(&self, snippet: &str, args: Value) -> Result<Value, AdminError> {
        run_shell(&self.program, &self.target, self.uri(), snippet, args).await
    }

    fn cluster(&self) -> ShellCluster {
        ShellCluster {
            program: self.program.clone(),
            target: self.target.clone(),
        }
    }
}

struct ShellCluster {
    program: String,
    target: ConnectOptions,
}

impl ShellCluster {
    async fn run(&self, snippet: &str, args: Value) -> Result<Value, AdminError> {
        let uri = format!(
            "{}@{}:{}",
            self.target.user, self.target.host, self.target.port
        );
        // Every cluster operation reacquires the handle; the shell process
        // does not outlive the call.
        let snippet = format!("c = dba.get_cluster()\n{}", snippet);
        run_shell(&self.program, &self.target, uri, &snippet, args).await
    }
}

fn indent(snippet: &str) -> String {
    snippet
        .lines()
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn run_shell(
    program: &str,
    target: &ConnectOptions,
    uri: String,
    snippet: &str,
    args: Value,
) -> Result<Value, AdminError> {
    let endpoint = target.address();
    let script = format!(
        "import json, os\n\
         args = json.loads(os.environ.get(\"{args_env}\", \"{{}}\"))\n\
         def emit(value):\n\
         \x20\x20\x20\x20print(\"{marker}\" + json.dumps(value))\n\
         try:\n\
         {body}\n\
         except Exception as exc:\n\
         \x20\x20\x20\x20emit({{\"error\": {{\"code\": getattr(exc, \"code\", 1), \"message\": str(exc)}}}})\n",
        args_env = ARGS_ENV,
        marker = RESULT_MARKER,
        body = indent(snippet),
    );

    let mut command = Command::new(program);
    command
        .arg(format!("--uri={}", uri))
        .arg("--py")
        .arg("--quiet-start=2")
        .arg("-e")
        .arg(&script)
        .env(ARGS_ENV, args.to_string())
        .kill_on_drop(true);
    if let Some(password) = &target.password {
        // password via the environment, never argv
        command.env("MYSQLSH_PWD", password).env("MYSQL_PWD", password);
    }

    let output = command.output().await.map_err(|error| AdminError::Connection {
        endpoint: endpoint.clone(),
        reason: format!("failed to spawn {}: {}", program, error),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(RESULT_MARKER));
    let line = match line {
        Some(line) => line,
        None => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdminError::Connection {
                endpoint,
                reason: format!(
                    "no result from shell (exit: {:?}): {}",
                    output.status.code(),
                    stderr.trim()
                ),
            });
        }
    };
    let value: Value = serde_json::from_str(line).map_err(|error| AdminError::Connection {
        endpoint: endpoint.clone(),
        reason: format!("unparsable shell result: {}", error),
    })?;

    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_u64).unwrap_or(1) as u32;
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown shell error");
        return Err(AdminError::from_code(code, message, &endpoint));
    }
    Ok(value)
}

#[async_trait]
impl DbaSession for ShellSession {
    fn endpoint(&self) -> String {
        self.target.address()
    }

    async fn get_cluster(&mut self) -> Result<Box<dyn GroupCluster>, AdminError> {
        self.run("dba.get_cluster()\nemit(True)", json!({})).await?;
        Ok(Box::new(self.cluster()))
    }

    async fn create_cluster(
        &mut self,
        name: &str,
        options: &CreateClusterOptions,
    ) -> Result<Box<dyn GroupCluster>, AdminError> {
        self.run(
            "dba.create_cluster(args[\"name\"], args[\"options\"])\nemit(True)",
            json!({ "name": name, "options": options }),
        )
        .await?;
        Ok(Box::new(self.cluster()))
    }

    async fn reboot_cluster_from_complete_outage(
        &mut self,
    ) -> Result<Box<dyn GroupCluster>, AdminError> {
        self.run("dba.reboot_cluster_from_complete_outage()\nemit(True)", json!({}))
            .await?;
        Ok(Box::new(self.cluster()))
    }

    async fn instance_info(&mut self) -> Result<InstanceInfo, AdminError> {
        let value = self
            .run(
                "row = session.run_sql(\"select @@server_id, @@server_uuid, @@report_host\").fetch_one()\n\
                 emit({\"server_id\": row[0], \"server_uuid\": row[1], \"report_host\": row[2]})",
                json!({}),
            )
            .await?;
        serde_json::from_value(value).map_err(|error| AdminError::Other {
            code: 1,
            message: format!("bad instance info: {}", error),
        })
    }

    async fn gtid_state(&mut self) -> Result<Option<GtidState>, AdminError> {
        let value = self
            .run(
                "try:\n\
                 \x20\x20\x20\x20row = session.run_sql(\"select @@global.gtid_executed, @@global.gtid_purged\").fetch_one()\n\
                 \x20\x20\x20\x20emit({\"executed\": row[0], \"purged\": row[1]})\n\
                 except Exception:\n\
                 \x20\x20\x20\x20emit(None)",
                json!({}),
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some).map_err(|error| AdminError::Other {
            code: 1,
            message: format!("bad gtid state: {}", error),
        })
    }

    async fn membership_info(&mut self) -> Result<MembershipProbe, AdminError> {
        let value = self
            .run(
                "row = session.run_sql(\"\"\"\n\
                 select m.member_id, nullif(m.member_role, ''), m.member_state, nullif(m.member_version, ''),\n\
                 \x20\x20\x20\x20\x20\x20 (select view_id from performance_schema.replication_group_member_stats\n\
                 \x20\x20\x20\x20\x20\x20\x20\x20 where member_id = @@server_uuid limit 1),\n\
                 \x20\x20\x20\x20\x20\x20 (select count(*) from performance_schema.replication_group_members),\n\
                 \x20\x20\x20\x20\x20\x20 (select count(*) from performance_schema.replication_group_members\n\
                 \x20\x20\x20\x20\x20\x20\x20\x20 where member_state <> 'UNREACHABLE')\n\
                 \x20\x20from performance_schema.replication_group_members m\n\
                 \x20\x20where m.member_id = @@server_uuid\n\
                 \"\"\").fetch_one()\n\
                 if row is None:\n\
                 \x20\x20\x20\x20emit({\"memberId\": \"\", \"role\": None, \"status\": \"OFFLINE\", \"viewId\": None, \"version\": None, \"memberCount\": 0, \"reachableMemberCount\": 0})\n\
                 else:\n\
                 \x20\x20\x20\x20emit({\"memberId\": row[0], \"role\": row[1], \"status\": row[2] or \"OFFLINE\", \"viewId\": row[4], \"version\": row[3], \"memberCount\": row[5], \"reachableMemberCount\": row[6]})",
                json!({}),
            )
            .await?;
        serde_json::from_value(value).map_err(|error| AdminError::Other {
            code: 1,
            message: format!("bad membership info: {}", error),
        })
    }

    async fn stop_group_replication(&mut self) -> Result<(), AdminError> {
        self.run(
            "session.run_sql(\"STOP GROUP_REPLICATION\")\nemit(True)",
            json!({}),
        )
        .await?;
        Ok(())
    }

    async fn user_has_grants(&mut self, user: &str) -> Result<bool, AdminError> {
        let value = self
            .run(
                "try:\n\
                 \x20\x20\x20\x20session.run_sql(\"show grants for ?@'%'\", [args[\"user\"]])\n\
                 \x20\x20\x20\x20emit(True)\n\
                 except Exception as exc:\n\
                 \x20\x20\x20\x20if getattr(exc, \"code\", 0) == 1141:\n\
                 \x20\x20\x20\x20\x20\x20\x20\x20emit(False)\n\
                 \x20\x20\x20\x20else:\n\
                 \x20\x20\x20\x20\x20\x20\x20\x20raise",
                json!({ "user": user }),
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn setup_backup_account(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<(), AdminError> {
        self.run(
            "session.run_sql(\"create user if not exists ?@'%' identified by ?\", [args[\"user\"], args[\"password\"]])\n\
             session.run_sql(\"grant select, reload, lock tables, process, replication client, backup_admin on *.* to ?@'%'\", [args[\"user\"]])\n\
             emit(True)",
            json!({ "user": user, "password": password }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GroupCluster for ShellCluster {
    async fn status(&mut self) -> Result<Value, AdminError> {
        self.run("emit(json.loads(str(c.status())))", json!({})).await
    }

    async fn add_instance(
        &mut self,
        target: &ConnectOptions,
        options: &AddInstanceOptions,
    ) -> Result<(), AdminError> {
        self.run(
            "c.add_instance(args[\"target\"], args[\"options\"])\nemit(True)",
            json!({ "target": target.address(), "options": options }),
        )
        .await?;
        Ok(())
    }

    async fn rejoin_instance(&mut self, endpoint: &str) -> Result<(), AdminError> {
        self.run(
            "c.rejoin_instance(args[\"target\"])\nemit(True)",
            json!({ "target": endpoint }),
        )
        .await?;
        Ok(())
    }

    async fn remove_instance(
        &mut self,
        endpoint: &str,
        options: &RemoveInstanceOptions,
    ) -> Result<(), AdminError> {
        self.run(
            "c.remove_instance(args[\"target\"], args[\"options\"])\nemit(True)",
            json!({ "target": endpoint, "options": options }),
        )
        .await?;
        Ok(())
    }

    async fn force_quorum_using_partition_of(
        &mut self,
        target: &ConnectOptions,
    ) -> Result<(), AdminError> {
        self.run(
            "c.force_quorum_using_partition_of(args[\"target\"])\nemit(True)",
            json!({ "target": target.address() }),
        )
        .await?;
        Ok(())
    }

    async fn setup_router_account(
        &mut self,
        user: &str,
        options: &RouterAccountOptions,
    ) -> Result<(), AdminError> {
        self.run(
            "c.setup_router_account(args[\"user\"], args[\"options\"])\nemit(True)",
            json!({ "user": user, "options": options }),
        )
        .await?;
        Ok(())
    }

    async fn metadata_member_uuids(&mut self) -> Result<Vec<String>, AdminError> {
        let value = self
            .run(
                "rows = session.run_sql(\"select mysql_server_uuid from mysql_innodb_cluster_metadata.instances\").fetch_all()\n\
                 emit([row[0] for row in rows])",
                json!({}),
            )
            .await?;
        serde_json::from_value(value).map_err(|error| AdminError::Other {
            code: 1,
            message: format!("bad metadata members: {}", error),
        })
    }

    async fn gtid_executed(&mut self) -> Result<GtidSet, AdminError> {
        let value = self
            .run(
                "emit(session.run_sql(\"select @@global.gtid_executed\").fetch_one()[0])",
                json!({}),
            )
            .await?;
        value
            .as_str()
            .unwrap_or_default()
            .parse()
            .map_err(|error| AdminError::Other {
                code: 1,
                message: format!("bad gtid set: {}", error),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippets_indent_into_the_try_block() {
        let body = indent("a = 1\nemit(a)");
        assert_eq!(body, "    a = 1\n    emit(a)");
    }
}
