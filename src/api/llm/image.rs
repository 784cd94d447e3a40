//! 题目图片下载，转成 base64 data URI 供多模态模型使用

use std::time::Duration;

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose};
use futures::future::join_all;
use reqwest::header::{self, HeaderMap, HeaderValue};
use tracing::{info, warn};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// 伪装成浏览器，部分图床会校验 Referer
fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        ),
    );
    headers.insert(header::REFERER, HeaderValue::from_static("https://mooc1.chaoxing.com/"));
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8"),
    );
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
    headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("image"));
    headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("no-cors"));
    headers.insert("Sec-Fetch-Site", HeaderValue::from_static("cross-site"));
    headers
}

/// 图片下载专用客户端：10 秒超时，跟随重定向
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .default_headers(browser_headers())
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .context("创建图片下载客户端失败")
}

/// 下载单张图片
pub async fn download_as_data_uri(client: &reqwest::Client, url: &str) -> Result<String> {
    let resp = client.get(url).send().await?;

    if !resp.status().is_success() {
        bail!("HTTP 错误: {}", resp.status());
    }

    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|ct| ct.contains("image/"))
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
        .unwrap_or_else(|| "image/jpeg".to_string());

    let bytes = resp.bytes().await?;
    info!("图片下载成功，大小: {} bytes", bytes.len());
    Ok(format!(
        "data:{};base64,{}",
        content_type,
        general_purpose::STANDARD.encode(&bytes)
    ))
}

/// 并发下载，保持原顺序，失败的图片跳过
pub async fn download_all(client: &reqwest::Client, urls: &[String]) -> Vec<String> {
    if urls.is_empty() {
        return Vec::new();
    }
    info!("开始下载 {} 张图片...", urls.len());

    let results = join_all(urls.iter().map(|url| download_as_data_uri(client, url))).await;

    let images: Vec<String> = results
        .into_iter()
        .zip(urls)
        .filter_map(|(result, url)| match result {
            Ok(uri) => Some(uri),
            Err(e) => {
                warn!("跳过无法下载的图片: {} ({})", url, e);
                None
            }
        })
        .collect();

    info!("成功下载 {}/{} 张图片", images.len(), urls.len());
    images
}
