// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Pagespeed Server
//!
//! Serves a directory of HTML documents through Pingora, rewriting the documents and the
//! resources they refer to for faster loading.

use async_trait::async_trait;
use clap::Parser;
use log::{error, info};
use pagespeed_module::{PagespeedConf, PagespeedHandler, PagespeedOpt};
use pagespeed_utils::{FromYaml, RequestFilter};
use pingora::proxy::{http_proxy_service, ProxyHttp, Session};
use pingora::server::configuration::{Opt as ServerOpt, ServerConf};
use pingora::server::Server;
use pingora::upstreams::peer::HttpPeer;
use pingora::{Error, ErrorType};
use serde::Deserialize;
use std::path::PathBuf;

/// Run Pagespeed Server
#[derive(Debug, Parser)]
struct Opt {
    /// Configuration file to load. This command line flag can be specified multiple times,
    /// settings of later files override those of earlier ones.
    #[clap(short, long)]
    conf: Option<Vec<PathBuf>>,

    /// Address and port to listen on, e.g. 127.0.0.1:8080. This command line flag can be
    /// specified multiple times.
    #[clap(short, long)]
    listen: Option<Vec<String>>,

    /// Run as daemon
    #[clap(short, long)]
    daemon: bool,

    /// Check the configuration and exit
    #[clap(short, long)]
    test: bool,

    #[clap(flatten)]
    pagespeed: PagespeedOpt,
}

/// The configuration of Pagespeed Server
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Conf {
    /// Addresses and ports to listen on
    listen: Vec<String>,

    /// Pingora server settings
    server: ServerConf,

    #[serde(flatten)]
    pagespeed: PagespeedConf,
}

#[derive(Debug)]
struct App {
    handler: PagespeedHandler,
}

#[async_trait]
impl ProxyHttp for App {
    type CTX = <PagespeedHandler as RequestFilter>::CTX;

    fn new_ctx(&self) -> Self::CTX {
        PagespeedHandler::new_ctx()
    }

    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<bool, Box<Error>> {
        self.handler.handle(session, ctx).await
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>, Box<Error>> {
        Err(Error::new(ErrorType::HTTPStatus(404)))
    }
}

fn main() {
    env_logger::init();

    let opt = Opt::parse();

    let mut conf = match Conf::load_from_files(opt.conf.as_deref().unwrap_or(&[])) {
        Ok(conf) => conf,
        Err(err) => {
            error!("{err}");
            Conf::default()
        }
    };
    conf.pagespeed.merge_with_opt(opt.pagespeed);

    let handler = match PagespeedHandler::new(conf.pagespeed) {
        Ok(handler) => handler,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    let mut listen = opt.listen.unwrap_or(conf.listen);
    if listen.is_empty() {
        listen.push("127.0.0.1:8080".into());
        listen.push("[::1]:8080".into());
    }

    let mut server = Server::new_with_opt_and_conf(
        ServerOpt {
            daemon: opt.daemon,
            test: opt.test,
            upgrade: false,
            nocapture: false,
            conf: None,
        },
        conf.server,
    );
    server.bootstrap();

    let mut proxy = http_proxy_service(&server.configuration, App { handler });
    for addr in &listen {
        info!("listening on {addr}");
        proxy.add_tcp(addr);
    }
    server.add_service(proxy);

    server.run_forever();
}
