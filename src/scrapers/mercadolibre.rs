use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::domain::listing::RawListing;
use crate::scrapers::{
    build_reqwest_client, select_first_attr, select_first_text, ScrapeError, ScrapeResult,
    SourceScraper,
};

const SOURCE_ID: &str = "mercadolibre";
/// Results per search page; pagination is offset-based (`_Desde_49`).
const PAGE_SIZE: u32 = 48;

/// Scraper for `mercadolibre.com.ve` car listings. Shares the search-card
/// markup family with TuCarro but uses offset pagination and its own
/// listing-id shape.
pub struct MercadolibreScraper {
    base_url: Url,
    client: reqwest::Client,
    id_re: Regex,
}

impl MercadolibreScraper {
    pub fn new() -> ScrapeResult<Self> {
        Ok(Self {
            base_url: Url::parse("https://www.mercadolibre.com.ve/")
                .map_err(|e| ScrapeError::Build(e.to_string()))?,
            client: build_reqwest_client()?,
            id_re: Regex::new(r"(MLV-?\d+)").map_err(|e| ScrapeError::Build(e.to_string()))?,
        })
    }

    fn page_url(&self, page: u32) -> String {
        let listing_path = format!("{}vehiculos/carros-camionetas", self.base_url);
        if page <= 1 {
            listing_path
        } else {
            format!("{listing_path}_Desde_{}", (page - 1) * PAGE_SIZE + 1)
        }
    }

    async fn get_text(&self, url: &str) -> ScrapeResult<String> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScrapeError::Http(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ScrapeError::Status {
                status: res.status().as_u16(),
                url: url.to_string(),
            });
        }
        res.text().await.map_err(|e| ScrapeError::Http(e.to_string()))
    }

    fn parse_page(&self, document: &Html) -> Vec<RawListing> {
        let card_selector =
            Selector::parse(".ui-search-result__wrapper, div.ui-search-result").unwrap();

        document
            .select(&card_selector)
            .filter_map(|card| self.parse_card(card))
            .collect()
    }

    fn parse_card(&self, card: scraper::ElementRef<'_>) -> Option<RawListing> {
        let title = select_first_text(
            card,
            &[
                "h2.ui-search-item__title",
                ".ui-search-item__title",
                "a.ui-search-item__group__element",
            ],
        )?;

        let mut listing = RawListing::new(SOURCE_ID);
        listing.raw_text = title.clone();
        listing.fields.insert("title".to_string(), title);

        if let Some(price) = select_first_text(
            card,
            &[
                ".ui-search-price__second-line .andes-money-amount__fraction",
                ".andes-money-amount__fraction",
            ],
        ) {
            listing.fields.insert("price".to_string(), price);
        }

        if let Some(currency) = select_first_text(card, &[".andes-money-amount__currency-symbol"]) {
            listing.fields.insert("currency".to_string(), currency);
        }

        if let Some(location) = select_first_text(
            card,
            &[".ui-search-item__location", ".ui-search-item__group--location"],
        ) {
            listing.fields.insert("location".to_string(), location);
        }

        if let Some(attrs) = select_first_text(card, &["ul.ui-search-card-attributes"]) {
            listing.fields.insert("details".to_string(), attrs);
        }

        if let Some(href) = select_first_attr(card, &["a.ui-search-link", "a"], "href") {
            if let Some(captures) = self.id_re.captures(&href) {
                listing.external_id = Some(captures[1].replace('-', ""));
            }
            listing.url = Some(href);
        }

        if let Some(image) =
            select_first_attr(card, &["img.ui-search-result-image__element", "img"], "data-src")
                .or_else(|| select_first_attr(card, &["img"], "src"))
        {
            listing.images.push(image);
        }

        Some(listing)
    }
}

#[async_trait]
impl SourceScraper for MercadolibreScraper {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch_page(&self, page: u32) -> ScrapeResult<Vec<RawListing>> {
        let url = self.page_url(page);
        let body = self.get_text(&url).await?;
        let document = Html::parse_document(&body);
        Ok(self.parse_page(&document))
    }
}
