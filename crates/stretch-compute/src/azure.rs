//! Azure Resource Manager implementation of [`Provisioner`].
//!
//! Authenticates as a service principal (client-credentials grant) and
//! caches the bearer token until shortly before it expires.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use stretch_core::AzureConfig;

use crate::error::{ComputeError, ComputeResult};
use crate::provisioner::{CreateVmRequest, Provisioner, VmResources, bootstrap_command};

const COMPUTE_API_VERSION: &str = "2023-09-01";
const NETWORK_API_VERSION: &str = "2023-09-01";
const DISK_API_VERSION: &str = "2023-04-02";

/// Refresh the token this long before it expires.
const TOKEN_SLACK: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct AzureProvisioner {
    client: Client,
    config: AzureConfig,
    token: Mutex<Option<CachedToken>>,
}

impl AzureProvisioner {
    pub fn new(config: AzureConfig) -> ComputeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
        })
    }

    fn resource_group_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}",
            self.config.subscription_id, self.config.resource_group
        )
    }

    fn nic_resource_id(&self, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Network/networkInterfaces/{name}",
            self.resource_group_id()
        )
    }

    fn public_ip_resource_id(&self, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Network/publicIPAddresses/{name}",
            self.resource_group_id()
        )
    }

    fn subnet_id(&self) -> String {
        format!(
            "{}/subnets/{}",
            self.config.vnet_id.trim_end_matches('/'),
            self.config.subnet_name
        )
    }

    async fn bearer_token(&self) -> ComputeResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.login_endpoint.trim_end_matches('/'),
            self.config.tenant_id
        );
        let scope = format!("{}/.default", self.config.arm_endpoint.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ComputeError::Auth(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ComputeError::Auth(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SLACK);
        debug!(expires_in = token.expires_in, "arm token refreshed");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn arm_url(&self, resource_id: &str, api_version: &str) -> String {
        format!(
            "{}{resource_id}?api-version={api_version}",
            self.config.arm_endpoint.trim_end_matches('/')
        )
    }

    async fn arm_request(
        &self,
        method: Method,
        resource_id: &str,
        api_version: &str,
        body: Option<&Value>,
    ) -> ComputeResult<reqwest::Response> {
        let token = self.bearer_token().await?;
        let url = self.arm_url(resource_id, api_version);
        let mut req = self.client.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    async fn arm_get(&self, resource_id: &str, api_version: &str) -> ComputeResult<Option<Value>> {
        let resp = self
            .arm_request(Method::GET, resource_id, api_version, None)
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let value: Value = resp
                    .json()
                    .await
                    .map_err(|e| ComputeError::Decode(e.to_string()))?;
                Ok(Some(value))
            }
            status => Err(ComputeError::Status {
                method: "GET",
                url: self.arm_url(resource_id, api_version),
                status: status.as_u16(),
            }),
        }
    }

    async fn arm_delete(&self, resource_id: &str, api_version: &str) -> ComputeResult<()> {
        let resp = self
            .arm_request(Method::DELETE, resource_id, api_version, None)
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!(%resource_id, "resource already gone");
                Ok(())
            }
            status if status.is_success() => Ok(()),
            status => Err(ComputeError::Status {
                method: "DELETE",
                url: self.arm_url(resource_id, api_version),
                status: status.as_u16(),
            }),
        }
    }

    async fn arm_put(&self, resource_id: &str, api_version: &str, body: &Value) -> ComputeResult<()> {
        let resp = self
            .arm_request(Method::PUT, resource_id, api_version, Some(body))
            .await?;
        if !resp.status().is_success() {
            return Err(ComputeError::Status {
                method: "PUT",
                url: self.arm_url(resource_id, api_version),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    fn public_ip_body(&self, name: &str) -> Value {
        json!({
            "location": self.config.region,
            "properties": {
                "publicIPAllocationMethod": "Dynamic",
                "dnsSettings": { "domainNameLabel": name }
            }
        })
    }

    fn nic_body(&self, name: &str) -> Value {
        json!({
            "location": self.config.region,
            "properties": {
                "ipConfigurations": [{
                    "name": "primary",
                    "properties": {
                        "primary": true,
                        "privateIPAllocationMethod": "Dynamic",
                        "subnet": { "id": self.subnet_id() },
                        "publicIPAddress": { "id": self.public_ip_resource_id(name) }
                    }
                }]
            }
        })
    }

    fn vm_body(&self, name: &str) -> Value {
        let mut boot_diagnostics = json!({ "enabled": true });
        if let Some(uri) = &self.config.boot_diagnostics_uri {
            boot_diagnostics["storageUri"] = json!(uri);
        }
        json!({
            "location": self.config.region,
            "identity": { "type": "SystemAssigned" },
            "properties": {
                "hardwareProfile": { "vmSize": self.config.vm_size },
                "storageProfile": {
                    "imageReference": { "id": self.config.custom_image },
                    "osDisk": { "createOption": "FromImage" }
                },
                "osProfile": {
                    "computerName": name,
                    "adminUsername": self.config.admin_username,
                    "adminPassword": self.config.admin_password,
                    "linuxConfiguration": { "disablePasswordAuthentication": false }
                },
                "networkProfile": {
                    "networkInterfaces": [{
                        "id": self.nic_resource_id(name),
                        "properties": { "primary": true }
                    }]
                },
                "diagnosticsProfile": { "bootDiagnostics": boot_diagnostics }
            }
        })
    }

    /// The command line carries the CI token, so it goes in the
    /// extension's protected settings.
    fn extension_body(&self, request: &CreateVmRequest) -> Value {
        json!({
            "location": self.config.region,
            "properties": {
                "publisher": "Microsoft.Azure.Extensions",
                "type": "CustomScript",
                "typeHandlerVersion": "2.0",
                "autoUpgradeMinorVersion": true,
                "settings": { "fileUris": [self.config.agent_install_script] },
                "protectedSettings": {
                    "commandToExecute": bootstrap_command(&self.config.agent_install_command, request)
                }
            }
        })
    }
}

/// Pull the attached resource ids out of a VM document.
fn vm_resources_from(vm_id: &str, vm: &Value) -> VmResources {
    let props = &vm["properties"];
    let nics = props["networkProfile"]["networkInterfaces"].as_array();
    let nic_id = nics
        .and_then(|nics| {
            nics.iter()
                .find(|n| n["properties"]["primary"].as_bool() == Some(true))
                .or_else(|| nics.first())
        })
        .and_then(|n| n["id"].as_str())
        .map(str::to_string);
    let disk_id = props["storageProfile"]["osDisk"]["managedDisk"]["id"]
        .as_str()
        .map(str::to_string);

    VmResources {
        vm_id: vm_id.to_string(),
        nic_id,
        public_ip_id: None,
        disk_id,
    }
}

/// Public IP id of the primary ip configuration of a NIC document.
fn public_ip_from(nic: &Value) -> Option<String> {
    let configs = nic["properties"]["ipConfigurations"].as_array()?;
    let primary = configs
        .iter()
        .find(|c| c["properties"]["primary"].as_bool() == Some(true))
        .or_else(|| configs.first())?;
    primary["properties"]["publicIPAddress"]["id"]
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl Provisioner for AzureProvisioner {
    fn vm_resource_id(&self, vm_name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Compute/virtualMachines/{vm_name}",
            self.resource_group_id()
        )
    }

    fn derived_resources(&self, vm_name: &str) -> VmResources {
        VmResources {
            vm_id: self.vm_resource_id(vm_name),
            nic_id: Some(self.nic_resource_id(vm_name)),
            public_ip_id: Some(self.public_ip_resource_id(vm_name)),
            disk_id: None,
        }
    }

    async fn get_vm(&self, vm_id: &str) -> ComputeResult<Option<VmResources>> {
        let Some(vm) = self.arm_get(vm_id, COMPUTE_API_VERSION).await? else {
            return Ok(None);
        };
        let mut resources = vm_resources_from(vm_id, &vm);
        if let Some(nic_id) = &resources.nic_id
            && let Some(nic) = self.arm_get(nic_id, NETWORK_API_VERSION).await?
        {
            resources.public_ip_id = public_ip_from(&nic);
        }
        Ok(Some(resources))
    }

    async fn delete_vm(&self, vm_id: &str) -> ComputeResult<()> {
        info!(%vm_id, "deleting vm");
        self.arm_delete(vm_id, COMPUTE_API_VERSION).await
    }

    async fn delete_nic(&self, nic_id: &str) -> ComputeResult<()> {
        info!(%nic_id, "deleting nic");
        self.arm_delete(nic_id, NETWORK_API_VERSION).await
    }

    async fn delete_public_ip(&self, ip_id: &str) -> ComputeResult<()> {
        info!(%ip_id, "deleting public ip");
        self.arm_delete(ip_id, NETWORK_API_VERSION).await
    }

    async fn delete_disk(&self, disk_id: &str) -> ComputeResult<()> {
        info!(%disk_id, "deleting disk");
        self.arm_delete(disk_id, DISK_API_VERSION).await
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> ComputeResult<()> {
        let name = request.vm_name.as_str();
        let vm_id = self.vm_resource_id(name);

        info!(vm_name = %name, "creating ip/nic");
        self.arm_put(
            &self.public_ip_resource_id(name),
            NETWORK_API_VERSION,
            &self.public_ip_body(name),
        )
        .await?;
        self.arm_put(&self.nic_resource_id(name), NETWORK_API_VERSION, &self.nic_body(name))
            .await?;

        info!(vm_name = %name, "creating vm");
        self.arm_put(&vm_id, COMPUTE_API_VERSION, &self.vm_body(name))
            .await?;
        self.arm_put(
            &format!("{vm_id}/extensions/CustomScript"),
            COMPUTE_API_VERSION,
            &self.extension_body(request),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{Method as HttpMethod, StatusCode as HttpStatus, Uri};
    use axum::response::{IntoResponse, Response};

    fn test_config(endpoint: &str) -> AzureConfig {
        AzureConfig {
            tenant_id: "tenant".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            subscription_id: "sub".to_string(),
            resource_group: "rg".to_string(),
            region: "westeurope".to_string(),
            vnet_id: "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/vnet".to_string(),
            subnet_name: "agents".to_string(),
            boot_diagnostics_uri: None,
            custom_image: "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/images/agent".to_string(),
            vm_size: "Standard_D2s_v3".to_string(),
            admin_username: "builder".to_string(),
            admin_password: "hunter2".to_string(),
            agent_install_script: "https://example.blob.core.windows.net/install.sh".to_string(),
            agent_install_command: "sh install.sh".to_string(),
            arm_endpoint: endpoint.to_string(),
            login_endpoint: endpoint.to_string(),
        }
    }

    fn sample_vm() -> Value {
        json!({
            "properties": {
                "networkProfile": { "networkInterfaces": [
                    { "id": "/nic/secondary", "properties": { "primary": false } },
                    { "id": "/nic/agent1", "properties": { "primary": true } }
                ]},
                "storageProfile": { "osDisk": { "managedDisk": { "id": "/disk/agent1" } } }
            }
        })
    }

    #[test]
    fn resource_ids_follow_agent_name() {
        let provisioner = AzureProvisioner::new(test_config("https://arm.test")).unwrap();

        assert_eq!(
            provisioner.vm_resource_id("agent1"),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/agent1"
        );
        let derived = provisioner.derived_resources("agent1");
        assert_eq!(
            derived.nic_id.as_deref(),
            Some("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/agent1")
        );
        assert_eq!(
            derived.public_ip_id.as_deref(),
            Some("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/publicIPAddresses/agent1")
        );
        assert!(derived.disk_id.is_none());
    }

    #[test]
    fn vm_document_yields_primary_nic_and_disk() {
        let resources = vm_resources_from("/vm/agent1", &sample_vm());
        assert_eq!(resources.nic_id.as_deref(), Some("/nic/agent1"));
        assert_eq!(resources.disk_id.as_deref(), Some("/disk/agent1"));
    }

    #[test]
    fn nic_document_yields_public_ip() {
        let nic = json!({ "properties": { "ipConfigurations": [
            { "properties": { "primary": true, "publicIPAddress": { "id": "/ip/agent1" } } }
        ]}});
        assert_eq!(public_ip_from(&nic).as_deref(), Some("/ip/agent1"));
        assert_eq!(public_ip_from(&json!({})), None);
    }

    #[test]
    fn extension_hides_token_in_protected_settings() {
        let provisioner = AzureProvisioner::new(test_config("https://arm.test")).unwrap();
        let request = CreateVmRequest {
            vm_name: "agent1".to_string(),
            ci_url: "https://dev.azure.com/contoso".to_string(),
            ci_token: "pat".to_string(),
            pool_name: "stretch".to_string(),
        };
        let body = provisioner.extension_body(&request);

        assert!(!body["properties"]["settings"].to_string().contains("pat"));
        assert_eq!(
            body["properties"]["protectedSettings"]["commandToExecute"],
            "sh install.sh https://dev.azure.com/contoso pat stretch agent1"
        );
    }

    type Log = Arc<StdMutex<Vec<String>>>;

    async fn fake_arm(State(log): State<Log>, method: HttpMethod, uri: Uri) -> Response {
        let path = uri.path().to_string();
        log.lock().unwrap().push(format!("{method} {path}"));

        if path.ends_with("/oauth2/v2.0/token") {
            let body = json!({ "access_token": "tok", "expires_in": 3600 });
            return axum::Json(body).into_response();
        }
        match (method, path.as_str()) {
            (HttpMethod::GET, "/vm/agent1") => axum::Json(sample_vm()).into_response(),
            (HttpMethod::GET, "/nic/agent1") => axum::Json(json!({
                "properties": { "ipConfigurations": [
                    { "properties": { "primary": true, "publicIPAddress": { "id": "/ip/agent1" } } }
                ]}
            }))
            .into_response(),
            (HttpMethod::DELETE, "/vm/agent1") => HttpStatus::ACCEPTED.into_response(),
            (HttpMethod::DELETE, "/disk/broken") => {
                HttpStatus::INTERNAL_SERVER_ERROR.into_response()
            }
            _ => HttpStatus::NOT_FOUND.into_response(),
        }
    }

    async fn start_server() -> (AzureProvisioner, Log) {
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        let router = Router::new().fallback(fake_arm).with_state(log.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let provisioner = AzureProvisioner::new(test_config(&format!("http://{addr}"))).unwrap();
        (provisioner, log)
    }

    #[tokio::test]
    async fn get_vm_reads_attached_resources() {
        let (provisioner, log) = start_server().await;

        let vm = provisioner.get_vm("/vm/agent1").await.unwrap().unwrap();
        assert_eq!(vm.nic_id.as_deref(), Some("/nic/agent1"));
        assert_eq!(vm.public_ip_id.as_deref(), Some("/ip/agent1"));
        assert_eq!(vm.disk_id.as_deref(), Some("/disk/agent1"));

        assert!(provisioner.get_vm("/vm/agent2").await.unwrap().is_none());

        // One token fetch serves every call.
        let tokens = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.ends_with("/token"))
            .count();
        assert_eq!(tokens, 1);
    }

    #[tokio::test]
    async fn deletes_tolerate_missing_resources() {
        let (provisioner, _log) = start_server().await;

        provisioner.delete_vm("/vm/agent1").await.unwrap();
        provisioner.delete_nic("/nic/gone").await.unwrap();

        let err = provisioner.delete_disk("/disk/broken").await.unwrap_err();
        assert!(matches!(err, ComputeError::Status { method: "DELETE", status: 500, .. }));
    }
}
